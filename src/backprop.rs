//! Reverse traversal of the producer graph.
//!
//! # Algorithm
//!
//! Starting from a value whose gradient is already populated, repeatedly:
//!
//! 1. take the value's producer link (operation, invocation record, output slot)
//! 2. run that operation's backward for the recorded inputs, which adds into
//!    every input gradient
//! 3. once every output of the invocation has been delivered, release one
//!    pending consumer on each input
//! 4. continue into each input whose pending count reached zero and which has
//!    a producer of its own
//!
//! An input consumed by several operations is therefore visited only after
//! all of them have contributed, so its gradient is complete before it is
//! sent further upstream. The walk uses an explicit stack, never recursion.
//!
//! A value whose consumers never run backward keeps a non-zero count and
//! stops the walk at that point.

use crate::error::Result;
use crate::tensors::NdArray;
use tracing::trace;

/// Sends the gradient already stored on `root` to every reachable input.
///
/// Does not seed `root`; see [`NdArray::backward`] for the ones-seeded entry
/// point.
///
/// # Errors
///
/// [`GraphError::MissingRecord`](crate::GraphError::MissingRecord) if a
/// producer has no pending invocation for this value (backward run twice, or
/// state reset in between), plus any error raised by an operation's backward.
pub fn propagate(root: &NdArray) -> Result<()> {
    let mut stack = vec![root.clone()];
    while let Some(y) = stack.pop() {
        let Some(producer) = y.parent() else {
            continue;
        };
        trace!(function = %producer.function.name(), output = producer.output, "backward");
        let settled = producer
            .function
            .backward_record(producer.record, producer.output, &y)?;
        let Some(inputs) = settled else {
            continue;
        };
        for x in inputs {
            if x.release() == 0 && x.has_parent() {
                stack.push(x);
            }
        }
    }
    Ok(())
}
