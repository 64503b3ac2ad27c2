//! Elementwise activations.

use crate::Real;
use crate::device::KernelManager;
use crate::error::{ModelError, Result};
use crate::function::{Arity, DeviceAffine, DeviceState, Function, FunctionCore};
use crate::ops::dispatch;
use crate::tensors::NdArray;
use core::fmt;

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    /// `max(0, x)`
    Relu,
    /// `1 / (1 + e^-x)`
    Sigmoid,
    /// `tanh(x)`
    Tanh,
}

impl ActivationKind {
    /// Every kind, in code order.
    pub const ALL: [Self; 3] = [Self::Relu, Self::Sigmoid, Self::Tanh];

    /// Applies the activation to one value.
    #[must_use]
    pub fn apply(self, x: Real) -> Real {
        match self {
            Self::Relu => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
        }
    }

    /// Derivative at the input that produced output `y`.
    #[must_use]
    pub fn derivative_from_output(self, y: Real) -> Real {
        match self {
            Self::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Sigmoid => y * (1.0 - y),
            Self::Tanh => 1.0 - y * y,
        }
    }

    /// Body of the WGSL `activate(v: Real) -> Real` helper.
    #[must_use]
    pub const fn wgsl(self) -> &'static str {
        match self {
            Self::Relu => "return max(v, Real(0));",
            Self::Sigmoid => "return Real(1) / (Real(1) + exp(-v));",
            Self::Tanh => "return tanh(v);",
        }
    }

    /// WGSL helper body for an optional activation.
    #[must_use]
    pub fn wgsl_or_identity(kind: Option<Self>) -> &'static str {
        kind.map_or("return v;", Self::wgsl)
    }

    /// Stable numeric code used in model files.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Relu => 1,
            Self::Sigmoid => 2,
            Self::Tanh => 3,
        }
    }

    /// Inverse of [`code`](Self::code).
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Standalone activation operation.
///
/// A [`Fusible`](crate::function::Fusible) predecessor can absorb it during
/// container compression.
pub struct Activation {
    core: FunctionCore,
    kind: ActivationKind,
    device: DeviceState,
}

impl Activation {
    /// Activation of the given kind.
    pub fn new(name: impl Into<String>, kind: ActivationKind) -> Self {
        Self {
            core: FunctionCore::new(name),
            kind,
            device: DeviceState::default(),
        }
    }

    /// The wrapped activation.
    #[must_use]
    pub fn kind(&self) -> ActivationKind {
        self.kind
    }

    pub(crate) fn from_attributes(name: &str, attrs: &[i64]) -> core::result::Result<Self, ModelError> {
        let kind = attrs
            .first()
            .copied()
            .and_then(ActivationKind::from_code)
            .ok_or_else(|| ModelError::InvalidDescriptor {
                kind: "activation".into(),
                reason: format!("bad activation code in {attrs:?}"),
            })?;
        Ok(Self::new(name, kind))
    }
}

impl Function for Activation {
    fn core(&self) -> &FunctionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FunctionCore {
        &mut self.core
    }

    fn kind(&self) -> &'static str {
        "activation"
    }

    fn arity(&self) -> Arity {
        Arity::Single
    }

    fn forward(&mut self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        let x = &xs[0];
        let out = dispatch::activation(&self.device, &x.data(), self.kind)?;
        Ok(vec![NdArray::from_batch(&x.shape(), x.batch_count(), out)?])
    }

    fn backward(&mut self, _output: usize, y: &NdArray, xs: &[NdArray]) -> Result<()> {
        let gx = crate::ops::cpu::activation_backward(&y.data(), &y.grad(), self.kind);
        xs[0].accumulate_grad(&gx)
    }

    fn attributes(&self) -> Vec<i64> {
        vec![self.kind.code()]
    }

    fn activation(&self) -> Option<ActivationKind> {
        Some(self.kind)
    }

    fn as_device_affine(&self) -> Option<&dyn DeviceAffine> {
        Some(self)
    }

    fn as_device_affine_mut(&mut self) -> Option<&mut dyn DeviceAffine> {
        Some(self)
    }
}

impl DeviceAffine for Activation {
    fn device_state(&self) -> &DeviceState {
        &self.device
    }

    fn device_state_mut(&mut self) -> &mut DeviceState {
        &mut self.device
    }

    fn kernel_label(&self) -> String {
        format!("activation_{}", self.kind)
    }

    fn kernel_source(&self, manager: &KernelManager) -> Result<String> {
        let src = manager.program_source(
            "activation",
            &self.kernel_label(),
            &[("ACTIVATION", self.kind.wgsl())],
        )?;
        Ok(src)
    }
}
