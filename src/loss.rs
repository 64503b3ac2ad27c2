//! Loss functions that seed the backward pass.
//!
//! A loss writes `dL/dy` straight into the prediction's gradient buffer and
//! returns the scalar loss. Follow it with
//! [`FunctionStack::backward`](crate::FunctionStack::backward) or
//! [`backprop::propagate`](crate::backprop::propagate).

use crate::Real;
use crate::error::{Result, ShapeError};
use crate::tensors::NdArray;
use rayon::prelude::*;

/// Mean squared error over every element and batch instance.
///
/// Overwrites `prediction.grad` with `2 (y - t) / N`.
///
/// # Errors
///
/// [`ShapeError::Mismatch`] if shapes or batch counts differ.
pub fn mean_squared_error(prediction: &NdArray, target: &NdArray) -> Result<Real> {
    if prediction.shape() != target.shape() || prediction.batch_count() != target.batch_count() {
        return Err(ShapeError::Mismatch {
            op: "mean_squared_error".into(),
            left: prediction.shape(),
            right: target.shape(),
        }
        .into());
    }
    let n = prediction.total_len() as Real;
    let (loss, grad): (Real, Vec<Real>) = {
        let (y, t) = (prediction.data(), target.data());
        let loss = y.par_iter().zip(&*t).map(|(a, b)| (a - b) * (a - b)).sum::<Real>() / n;
        let grad = y.par_iter().zip(&*t).map(|(a, b)| 2.0 * (a - b) / n).collect();
        (loss, grad)
    };
    prediction.grad_mut().copy_from_slice(&grad);
    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mse_value_and_gradient() {
        let y = NdArray::from_vec(&[2], vec![1.0, 3.0]).unwrap();
        let t = NdArray::from_vec(&[2], vec![0.0, 1.0]).unwrap();
        let loss = mean_squared_error(&y, &t).unwrap();
        assert!((loss - 2.5).abs() < 1e-6);
        assert_eq!(y.grad_to_vec(), vec![1.0, 2.0]);
        assert!(mean_squared_error(&y, &NdArray::new(&[3], 1).unwrap()).is_err());
    }
}
