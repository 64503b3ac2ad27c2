//! Affine transform with an optional fused activation.

use super::ActivationKind;
use crate::Real;
use crate::device::KernelManager;
use crate::error::{ModelError, Result, ShapeError};
use crate::function::{Arity, DeviceAffine, DeviceState, Fusible, Function, FunctionCore};
use crate::ops::cpu::{self, LinearDims};
use crate::ops::dispatch;
use crate::tensors::NdArray;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

/// `y = act(x · Wᵀ + b)` over the last axis of `x`.
///
/// `W` has shape `[outputs, inputs]` and `b` shape `[outputs]`. Leading axes
/// of `x` and its batch instances are treated as independent rows.
pub struct Linear {
    core: FunctionCore,
    inputs: usize,
    outputs: usize,
    weight: NdArray,
    bias: NdArray,
    activation: Option<ActivationKind>,
    device: DeviceState,
}

impl Linear {
    /// Uniformly initialized in `±1/sqrt(inputs)` from OS entropy.
    ///
    /// # Errors
    ///
    /// Fails if either size is zero.
    pub fn new(name: impl Into<String>, inputs: usize, outputs: usize) -> Result<Self> {
        Self::seeded(name, inputs, outputs, rand::random())
    }

    /// Like [`new`](Self::new) with a fixed seed.
    ///
    /// # Errors
    ///
    /// Fails if either size is zero.
    pub fn seeded(name: impl Into<String>, inputs: usize, outputs: usize, seed: u64) -> Result<Self> {
        let bound = 1.0 / (inputs.max(1) as Real).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let weight = (0..inputs * outputs)
            .map(|_| rng.random_range(-bound..=bound))
            .collect();
        let bias = (0..outputs).map(|_| rng.random_range(-bound..=bound)).collect();
        Self::with_params(name, inputs, outputs, weight, bias)
    }

    /// Explicit row-major weights `[outputs, inputs]` and bias `[outputs]`.
    ///
    /// # Errors
    ///
    /// Fails if a size is zero or a buffer has the wrong length.
    pub fn with_params(
        name: impl Into<String>,
        inputs: usize,
        outputs: usize,
        weight: Vec<Real>,
        bias: Vec<Real>,
    ) -> Result<Self> {
        let weight = NdArray::from_vec(&[outputs, inputs], weight)?;
        let bias = NdArray::from_vec(&[outputs], bias)?;
        Ok(Self {
            core: FunctionCore::new(name),
            inputs,
            outputs,
            weight,
            bias,
            activation: None,
            device: DeviceState::default(),
        })
    }

    pub(crate) fn from_parts(
        name: &str,
        attrs: &[i64],
        params: Vec<NdArray>,
    ) -> core::result::Result<Self, ModelError> {
        let invalid = |reason: String| ModelError::InvalidDescriptor {
            kind: "linear".into(),
            reason,
        };
        let [inputs, outputs, act] = attrs else {
            return Err(invalid(format!("expected 3 attributes, got {attrs:?}")));
        };
        let [weight, bias] = <[NdArray; 2]>::try_from(params)
            .map_err(|p| invalid(format!("expected 2 parameters, got {}", p.len())))?;
        let (inputs, outputs) = (*inputs as usize, *outputs as usize);
        if weight.shape() != [outputs, inputs] || bias.shape() != [outputs] {
            return Err(invalid(format!(
                "parameter shapes {:?} and {:?} do not match {inputs} -> {outputs}",
                weight.shape(),
                bias.shape()
            )));
        }
        let activation = match *act {
            0 => None,
            code => Some(ActivationKind::from_code(code).ok_or_else(|| invalid(format!("bad activation code {code}")))?),
        };
        Ok(Self {
            core: FunctionCore::new(name),
            inputs,
            outputs,
            weight,
            bias,
            activation,
            device: DeviceState::default(),
        })
    }

    /// Weight handle, `[outputs, inputs]`.
    #[must_use]
    pub fn weight(&self) -> &NdArray {
        &self.weight
    }

    /// Bias handle, `[outputs]`.
    #[must_use]
    pub fn bias(&self) -> &NdArray {
        &self.bias
    }

    fn dims(&self, x: &NdArray) -> Result<LinearDims> {
        let shape = x.shape();
        if shape.last() != Some(&self.inputs) {
            return Err(ShapeError::Mismatch {
                op: self.core.name.clone(),
                left: vec![self.inputs],
                right: shape,
            }
            .into());
        }
        Ok(LinearDims {
            rows: x.total_len() / self.inputs,
            inputs: self.inputs,
            outputs: self.outputs,
        })
    }
}

impl Function for Linear {
    fn core(&self) -> &FunctionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FunctionCore {
        &mut self.core
    }

    fn kind(&self) -> &'static str {
        "linear"
    }

    fn arity(&self) -> Arity {
        Arity::Single
    }

    fn forward(&mut self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        let x = &xs[0];
        let dims = self.dims(x)?;
        let out = dispatch::linear(
            &self.device,
            &x.data(),
            &self.weight.data(),
            &self.bias.data(),
            dims,
            self.activation,
        )?;
        let mut shape = x.shape();
        if let Some(last) = shape.last_mut() {
            *last = self.outputs;
        }
        Ok(vec![NdArray::from_batch(&shape, x.batch_count(), out)?])
    }

    fn backward(&mut self, _output: usize, y: &NdArray, xs: &[NdArray]) -> Result<()> {
        let x = &xs[0];
        let dims = self.dims(x)?;
        let grads = cpu::linear_backward(
            &x.data(),
            &self.weight.data(),
            &y.data(),
            &y.grad(),
            dims,
            self.activation,
        );
        x.accumulate_grad(&grads.x)?;
        self.weight.accumulate_grad(&grads.weight)?;
        self.bias.accumulate_grad(&grads.bias)
    }

    fn parameters(&self) -> Vec<NdArray> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn attributes(&self) -> Vec<i64> {
        vec![
            self.inputs as i64,
            self.outputs as i64,
            self.activation.map_or(0, ActivationKind::code),
        ]
    }

    fn as_fusible(&self) -> Option<&dyn Fusible> {
        Some(self)
    }

    fn as_fusible_mut(&mut self) -> Option<&mut dyn Fusible> {
        Some(self)
    }

    fn as_device_affine(&self) -> Option<&dyn DeviceAffine> {
        Some(self)
    }

    fn as_device_affine_mut(&mut self) -> Option<&mut dyn DeviceAffine> {
        Some(self)
    }
}

impl Fusible for Linear {
    fn fused_activation(&self) -> Option<ActivationKind> {
        self.activation
    }

    fn fuse(&mut self, activation: ActivationKind) -> bool {
        if self.activation.is_some() {
            return false;
        }
        self.activation = Some(activation);
        if let Err(e) = self.compile_kernel() {
            warn!(function = %self.core.name, error = %e, "fused kernel failed to compile, using cpu");
        }
        true
    }
}

impl DeviceAffine for Linear {
    fn device_state(&self) -> &DeviceState {
        &self.device
    }

    fn device_state_mut(&mut self) -> &mut DeviceState {
        &mut self.device
    }

    fn kernel_label(&self) -> String {
        match self.activation {
            Some(act) => format!("linear_{act}"),
            None => "linear".into(),
        }
    }

    fn kernel_source(&self, manager: &KernelManager) -> Result<String> {
        let src = manager.program_source(
            "linear",
            &self.kernel_label(),
            &[("ACTIVATION", ActivationKind::wgsl_or_identity(self.activation))],
        )?;
        Ok(src)
    }
}
