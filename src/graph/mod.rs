//! Graph containers.
//!
//! - [`FunctionStack`]: a linear chain, each output feeding the next input
//! - [`FunctionDictionary`]: operations wired by port name, with fan-out and
//!   merging
//!
//! Both forward, backward, update and reset as a unit, and both offer
//! `compress`: one left-to-right pass that folds an activation into the
//! fusible operation right before it. The pass is not repeated to a fixed
//! point.

mod dictionary;
mod stack;

pub use dictionary::FunctionDictionary;
pub use stack::FunctionStack;

use crate::device::KernelManager;
use crate::function::FunctionRef;
use tracing::debug;

/// Folds `next` into `head` if `head` is fusible without an activation and
/// `next` is a plain activation. Neither may have pending invocations.
pub(crate) fn fuse_pair(head: &FunctionRef, next: &FunctionRef) -> bool {
    if head.ptr_eq(next) {
        return false;
    }
    let Some(kind) = next.borrow().activation() else {
        return false;
    };
    if head.pending() > 0 || next.pending() > 0 {
        debug!(head = %head.name(), next = %next.name(), "pending invocations, not fusing");
        return false;
    }
    let outputs = next.borrow().core().output_names.clone();

    let mut h = head.borrow_mut();
    let fused = match h.as_fusible_mut() {
        Some(f) if f.fused_activation().is_none() => f.fuse(kind),
        _ => false,
    };
    if fused {
        h.core_mut().output_names = outputs;
    }
    fused
}

pub(crate) fn set_device_enable_all(functions: &[FunctionRef], enable: bool, manager: &KernelManager) -> bool {
    let mut all = true;
    for f in functions {
        let capable = f.borrow().as_device_affine().is_some();
        if capable && !f.set_device_enable(enable, manager) {
            all = false;
        }
    }
    all
}
