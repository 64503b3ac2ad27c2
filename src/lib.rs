//! # `briny_grad`
//!
//! A small reverse-mode automatic differentiation engine built around an
//! explicit computation graph. Tensor values remember the operation that
//! produced them, operations remember what they consumed, and a backward
//! traversal walks that chain to accumulate gradients.
//!
//! ## Features
//!
//! - **Tensors**: [`NdArray`] values with a gradient buffer, batch count and
//!   producer back-reference
//! - **Operations**: the [`Function`] trait with single, dual, multi input and
//!   multi output arities, plus capability traits for parameters, device
//!   affinity and fusion
//! - **Containers**: linear [`FunctionStack`] and name-addressed
//!   [`FunctionDictionary`] graphs with a single-pass linear fusion
//! - **Devices**: an explicitly constructed [`KernelManager`] that compiles WGSL
//!   kernels through `wgpu` (feature `wgpu`) with transparent CPU fallback
//! - **Optimizers**: [`optim::Sgd`] and [`optim::Adam`] behind the
//!   [`optim::Optimizer`] trait
//! - **Persistence**: checksummed binary model files via [`modelio`]
//!
//! ## Example
//!
//! ```rust
//! use briny_grad::functions::{Activation, ActivationKind, Linear};
//! use briny_grad::{FunctionStack, NdArray};
//!
//! # fn main() -> briny_grad::Result<()> {
//! let mut net = FunctionStack::new("mlp");
//! net.push(Linear::with_params("fc", 2, 1, vec![0.5, -0.5], vec![0.0])?);
//! net.push(Activation::new("act", ActivationKind::Tanh));
//!
//! let x = NdArray::from_vec(&[2], vec![1.0, 2.0])?;
//! let y = net.forward(&[x])?;
//! y[0].backward()?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::many_single_char_names,
    clippy::similar_names
)]
#![deny(unsafe_code)]

pub mod approx;
pub mod backend;
pub mod backprop;
pub mod device;
mod error;
pub mod function;
pub mod functions;
pub mod graph;
pub mod loss;
pub mod modelio;
pub mod ops;
pub mod optim;
pub mod tensors;

pub use device::KernelManager;
pub use error::{DeviceError, Error, GraphError, ModelError, Result, ShapeError};
pub use function::{Arity, Function, FunctionRef};
pub use graph::{FunctionDictionary, FunctionStack};
pub use tensors::NdArray;

/// The scalar used by every tensor buffer.
///
/// - `f32` by default
/// - `f64` with the `f64` feature
#[cfg(not(feature = "f64"))]
pub type Real = f32;
/// The scalar used by every tensor buffer.
///
/// - `f32` by default
/// - `f64` with the `f64` feature
#[cfg(feature = "f64")]
pub type Real = f64;
