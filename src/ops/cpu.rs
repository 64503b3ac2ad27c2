//! Parallel CPU kernels.
//!
//! Plain slice-in, vector-out implementations of the numeric kernels used by
//! [`functions`](crate::functions). Rows are split across the `rayon` pool;
//! each output element is still summed in a fixed order, so results are
//! deterministic.
//!
//! Every device kernel has a counterpart here with identical indexing, which
//! is what operations fall back to when no device program is armed.

use crate::Real;
use crate::functions::ActivationKind;
use rayon::prelude::*;

/// Problem size of an affine transform `y = x · Wᵀ + b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearDims {
    /// Independent rows of `x`.
    pub rows: usize,
    /// Features per input row.
    pub inputs: usize,
    /// Features per output row.
    pub outputs: usize,
}

impl LinearDims {
    /// Packs the sizes into the uniform block the device kernels read.
    #[must_use]
    pub fn uniform(self) -> [u32; 4] {
        [self.rows as u32, self.inputs as u32, self.outputs as u32, 0]
    }
}

/// Gradients produced by [`linear_backward`].
#[derive(Debug, Clone, PartialEq)]
pub struct LinearGrads {
    /// Gradient with respect to the input rows.
    pub x: Vec<Real>,
    /// Gradient with respect to the `[outputs, inputs]` weight matrix.
    pub weight: Vec<Real>,
    /// Gradient with respect to the bias.
    pub bias: Vec<Real>,
}

/// `act(x · Wᵀ + b)` for row-major `x: [rows, inputs]`, `W: [outputs, inputs]`.
#[must_use]
pub fn linear(
    x: &[Real],
    weight: &[Real],
    bias: &[Real],
    dims: LinearDims,
    activation: Option<ActivationKind>,
) -> Vec<Real> {
    let LinearDims { inputs, outputs, .. } = dims;
    let mut out = vec![0.0; dims.rows * outputs];
    out.par_chunks_mut(outputs)
        .zip(x.par_chunks(inputs))
        .for_each(|(row, xr)| {
            for (o, y) in row.iter_mut().enumerate() {
                let w = &weight[o * inputs..(o + 1) * inputs];
                let z = bias[o] + xr.iter().zip(w).map(|(a, b)| a * b).sum::<Real>();
                *y = activation.map_or(z, |act| act.apply(z));
            }
        });
    out
}

/// Backward of [`linear`], given its output `y` and upstream gradient `gy`.
///
/// The activation derivative is expressed through `y`, which makes a fused
/// transform numerically identical to the unfused pair.
#[must_use]
pub fn linear_backward(
    x: &[Real],
    weight: &[Real],
    y: &[Real],
    gy: &[Real],
    dims: LinearDims,
    activation: Option<ActivationKind>,
) -> LinearGrads {
    let LinearDims {
        rows,
        inputs,
        outputs,
    } = dims;
    let gz = match activation {
        Some(act) => activation_backward(y, gy, act),
        None => gy.to_vec(),
    };

    let mut gx = vec![0.0; rows * inputs];
    gx.par_chunks_mut(inputs)
        .zip(gz.par_chunks(outputs))
        .for_each(|(gxr, gzr)| {
            for (o, &g) in gzr.iter().enumerate() {
                let w = &weight[o * inputs..(o + 1) * inputs];
                for (dst, wi) in gxr.iter_mut().zip(w) {
                    *dst += g * wi;
                }
            }
        });

    let mut gw = vec![0.0; outputs * inputs];
    gw.par_chunks_mut(inputs).enumerate().for_each(|(o, gwr)| {
        for r in 0..rows {
            let g = gz[r * outputs + o];
            let xr = &x[r * inputs..(r + 1) * inputs];
            for (dst, xi) in gwr.iter_mut().zip(xr) {
                *dst += g * xi;
            }
        }
    });

    let bias = (0..outputs)
        .map(|o| (0..rows).map(|r| gz[r * outputs + o]).sum())
        .collect();

    LinearGrads {
        x: gx,
        weight: gw,
        bias,
    }
}

/// Elementwise activation.
#[must_use]
pub fn activation(x: &[Real], kind: ActivationKind) -> Vec<Real> {
    x.par_iter().map(|&v| kind.apply(v)).collect()
}

/// `gy * act'(x)` with the derivative taken from the output `y`.
#[must_use]
pub fn activation_backward(y: &[Real], gy: &[Real], kind: ActivationKind) -> Vec<Real> {
    y.par_iter()
        .zip(gy)
        .map(|(&v, &g)| g * kind.derivative_from_output(v))
        .collect()
}

/// Elementwise `a + b`.
#[must_use]
pub fn add(a: &[Real], b: &[Real]) -> Vec<Real> {
    a.par_iter().zip(b).map(|(x, y)| x + y).collect()
}

/// Elementwise `a * b`.
#[must_use]
pub fn mul(a: &[Real], b: &[Real]) -> Vec<Real> {
    a.par_iter().zip(b).map(|(x, y)| x * y).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: LinearDims = LinearDims {
        rows: 2,
        inputs: 3,
        outputs: 2,
    };

    #[test]
    fn linear_matches_hand_computation() {
        let x = [1.0, 2.0, 3.0, -1.0, 0.0, 1.0];
        let w = [0.5, -1.0, 0.25, 1.0, 1.0, 1.0];
        let b = [0.1, -0.2];
        let y = linear(&x, &w, &b, DIMS, None);
        // row 0: 0.5 - 2 + 0.75 + 0.1, 6 - 0.2
        // row 1: -0.5 + 0.25 + 0.1,     0 - 0.2
        let expected = [-0.65, 5.8, -0.15, -0.2];
        for (a, e) in y.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{y:?}");
        }
    }

    #[test]
    fn linear_backward_sums_over_rows() {
        let x = [1.0, 2.0, 3.0, -1.0, 0.0, 1.0];
        let w = [0.5, -1.0, 0.25, 1.0, 1.0, 1.0];
        let y = linear(&x, &w, &[0.0, 0.0], DIMS, None);
        let gy = [1.0, 0.0, 0.0, 2.0];
        let g = linear_backward(&x, &w, &y, &gy, DIMS, None);
        assert_eq!(g.bias, vec![1.0, 2.0]);
        assert_eq!(g.weight, vec![1.0, 2.0, 3.0, -2.0, 0.0, 2.0]);
        assert_eq!(g.x, vec![0.5, -1.0, 0.25, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn fused_backward_equals_separate_steps() {
        let x = [0.3, -0.7, 1.1, 0.4, 0.9, -0.2];
        let w = [0.5, -1.0, 0.25, 1.0, 1.0, 1.0];
        let b = [0.1, -0.2];
        let gy = [0.2, -0.4, 1.0, 0.5];
        for act in [ActivationKind::Relu, ActivationKind::Sigmoid, ActivationKind::Tanh] {
            let fused_y = linear(&x, &w, &b, DIMS, Some(act));
            let fused = linear_backward(&x, &w, &fused_y, &gy, DIMS, Some(act));

            let z = linear(&x, &w, &b, DIMS, None);
            let a = activation(&z, act);
            assert_eq!(a, fused_y);
            let gz = activation_backward(&a, &gy, act);
            let plain = linear_backward(&x, &w, &z, &gz, DIMS, None);
            assert_eq!(plain, fused);
        }
    }
}
