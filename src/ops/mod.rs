//! # Numeric Kernels
//!
//! Execution paths for the math behind [`functions`](crate::functions).
//!
//! ## Submodules
//!
//! - [`cpu`]: `rayon`-parallel reference kernels, always available
//! - [`dispatch`]: routes a call to an armed device program or to [`cpu`]
//! - `wgpu` *(feature `wgpu`)*: device selection, WGSL compilation and
//!   blocking dispatch
//!
//! Kernel sources live in `src/ops/shaders/` as templates and are completed
//! by [`KernelManager::program_source`](crate::KernelManager::program_source).

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "wgpu")]
pub mod wgpu;
