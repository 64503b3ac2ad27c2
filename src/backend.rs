//! Device selection options.
//!
//! This module defines which accelerator class the [`KernelManager`] should
//! look for and which floating-point precision its kernels use.
//!
//! # Device Classes
//!
//! - `Default`: whatever adapter the platform prefers.
//! - `Cpu`: software adapters only.
//! - `Gpu`: discrete, integrated or virtual GPUs.
//! - `Accelerator`: adapters that report neither CPU nor GPU.
//! - `All`: the first adapter of any kind.
//!
//! Options are passed explicitly to [`KernelManager::initialize`]; there is no
//! global backend switch. [`DeviceOptions::from_env`] reads overrides from
//! `BRINY_GRAD_DEVICE` and `BRINY_GRAD_PRECISION`.
//!
//! [`KernelManager`]: crate::KernelManager
//! [`KernelManager::initialize`]: crate::KernelManager::initialize

use core::fmt;
use core::str::FromStr;
use tracing::warn;

/// Environment variable selecting the device class.
pub const DEVICE_ENV: &str = "BRINY_GRAD_DEVICE";
/// Environment variable selecting the kernel precision.
pub const PRECISION_ENV: &str = "BRINY_GRAD_PRECISION";

/// Accelerator class filter used during initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DeviceClass {
    /// The platform's preferred adapter.
    #[default]
    Default = 0,
    /// Software rasterizers / CPU adapters.
    Cpu = 1,
    /// Any kind of GPU.
    Gpu = 2,
    /// Adapters of an unknown or dedicated kind.
    Accelerator = 3,
    /// Any adapter at all.
    All = 4,
}

impl TryFrom<u8> for DeviceClass {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::Cpu),
            2 => Ok(Self::Gpu),
            3 => Ok(Self::Accelerator),
            4 => Ok(Self::All),
            _ => Err(()),
        }
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            "accelerator" => Ok(Self::Accelerator),
            "all" | "any" => Ok(Self::All),
            other => Err(format!("unknown device class `{other}`")),
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Accelerator => "accelerator",
            Self::All => "all",
        };
        f.write_str(name)
    }
}

/// Floating-point precision of generated kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// 32-bit kernels.
    Single,
    /// 64-bit kernels; needs the `SHADER_F64` device feature.
    Double,
}

impl Default for Precision {
    fn default() -> Self {
        #[cfg(feature = "f64")]
        {
            Self::Double
        }
        #[cfg(not(feature = "f64"))]
        {
            Self::Single
        }
    }
}

impl Precision {
    /// WGSL scalar type name.
    #[must_use]
    pub const fn wgsl_type(self) -> &'static str {
        match self {
            Self::Single => "f32",
            Self::Double => "f64",
        }
    }

    /// Bytes per scalar on the device.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Single => 4,
            Self::Double => 8,
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "f32" => Ok(Self::Single),
            "double" | "f64" => Ok(Self::Double),
            other => Err(format!("unknown precision `{other}`")),
        }
    }
}

/// Configuration for [`KernelManager::initialize`](crate::KernelManager::initialize).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceOptions {
    /// Which adapters are acceptable.
    pub class: DeviceClass,
    /// Kernel precision.
    pub precision: Precision,
}

impl DeviceOptions {
    /// Options with the given class and the default precision.
    #[must_use]
    pub fn with_class(class: DeviceClass) -> Self {
        Self {
            class,
            ..Self::default()
        }
    }

    /// Reads overrides from the environment.
    ///
    /// Unset variables keep the defaults; unparsable ones are reported with
    /// `warn!` and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        if let Some(raw) = lookup(DEVICE_ENV) {
            match raw.parse() {
                Ok(class) => options.class = class,
                Err(e) => warn!("{DEVICE_ENV}: {e}, using `{}`", options.class),
            }
        }
        if let Some(raw) = lookup(PRECISION_ENV) {
            match raw.parse() {
                Ok(precision) => options.precision = precision,
                Err(e) => warn!("{PRECISION_ENV}: {e}, using {:?}", options.precision),
            }
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_classes() {
        assert_eq!("GPU".parse::<DeviceClass>(), Ok(DeviceClass::Gpu));
        assert_eq!("any".parse::<DeviceClass>(), Ok(DeviceClass::All));
        assert!("tpu".parse::<DeviceClass>().is_err());
        assert_eq!(DeviceClass::try_from(3), Ok(DeviceClass::Accelerator));
        assert!(DeviceClass::try_from(9).is_err());
    }

    #[test]
    fn lookup_overrides_and_ignores_garbage() {
        let options = DeviceOptions::from_lookup(|key| match key {
            DEVICE_ENV => Some("cpu".into()),
            PRECISION_ENV => Some("quad".into()),
            _ => None,
        });
        assert_eq!(options.class, DeviceClass::Cpu);
        assert_eq!(options.precision, Precision::default());
    }
}
