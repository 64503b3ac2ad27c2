//! Device-or-CPU routing.
//!
//! Each entry point runs the armed device program when the operation holds
//! one, and the [`cpu`] kernel otherwise. Device failures at this stage are
//! returned, not absorbed: the fallback decision is made once, when the
//! operation is armed through
//! [`DeviceAffine::set_device_enable`](crate::function::DeviceAffine::set_device_enable).

use super::cpu::{self, LinearDims};
use crate::Real;
use crate::error::Result;
use crate::function::DeviceState;
use crate::functions::ActivationKind;

/// Affine transform with optional fused activation.
///
/// # Errors
///
/// Device dispatch errors when a program is armed.
pub fn linear(
    device: &DeviceState,
    x: &[Real],
    weight: &[Real],
    bias: &[Real],
    dims: LinearDims,
    activation: Option<ActivationKind>,
) -> Result<Vec<Real>> {
    if let Some((manager, program)) = device.program() {
        let out = manager.run(program, dims.uniform(), &[x, weight, bias], dims.rows * dims.outputs)?;
        return Ok(out);
    }
    Ok(cpu::linear(x, weight, bias, dims, activation))
}

/// Elementwise activation.
///
/// # Errors
///
/// Device dispatch errors when a program is armed.
pub fn activation(device: &DeviceState, x: &[Real], kind: ActivationKind) -> Result<Vec<Real>> {
    if let Some((manager, program)) = device.program() {
        let out = manager.run(program, [x.len() as u32, 0, 0, 0], &[x], x.len())?;
        return Ok(out);
    }
    Ok(cpu::activation(x, kind))
}
