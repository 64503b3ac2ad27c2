//! Error taxonomy shared by every module.
//!
//! Shape and graph errors are construction bugs and are never absorbed.
//! Device errors may be absorbed at `set_device_enable`, which reports the
//! outcome through its return value.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Any failure raised by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong rank, incompatible shapes or wrong input count.
    #[error(transparent)]
    Shape(#[from] ShapeError),
    /// Inconsistent graph bookkeeping.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Accelerator setup, compilation or dispatch failure.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Model file could not be written or read back.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Shape and arity mismatches, detected eagerly.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    /// A dimension or the batch count was zero.
    #[error("invalid shape {shape:?} with batch count {batch_count}: every dimension must be positive")]
    InvalidDimension {
        /// Offending shape.
        shape: Vec<usize>,
        /// Offending batch count.
        batch_count: usize,
    },
    /// The flat buffer length does not match the shape.
    #[error("buffer of {actual} elements does not fit shape {shape:?} x {batch_count} batches ({expected} expected)")]
    DataLength {
        /// Target shape.
        shape: Vec<usize>,
        /// Batch count.
        batch_count: usize,
        /// Elements required.
        expected: usize,
        /// Elements supplied.
        actual: usize,
    },
    /// Reshape target has a different element count.
    #[error("cannot reshape {from:?} into {to:?}: element counts differ")]
    ElementCount {
        /// Current shape.
        from: Vec<usize>,
        /// Requested shape (`-1` marks the wildcard).
        to: Vec<isize>,
    },
    /// More than one `-1` in a reshape request.
    #[error("reshape target {0:?} has more than one inferred dimension")]
    MultipleWildcards(Vec<isize>),
    /// A negative size other than `-1`, or a zero, in a reshape request.
    #[error("reshape target {0:?} contains an invalid dimension")]
    InvalidWildcard(Vec<isize>),
    /// Axis beyond the tensor rank.
    #[error("axis {axis} is out of range for rank {rank}")]
    AxisOutOfRange {
        /// Requested axis.
        axis: usize,
        /// Tensor rank.
        rank: usize,
    },
    /// Same axis listed twice.
    #[error("axis {0} listed more than once")]
    DuplicateAxis(usize),
    /// Operands of an operation disagree.
    #[error("`{op}`: shape {left:?} is incompatible with {right:?}")]
    Mismatch {
        /// Operation name.
        op: String,
        /// Left or expected shape.
        left: Vec<usize>,
        /// Right or actual shape.
        right: Vec<usize>,
    },
    /// Source shape cannot be broadcast to target shape.
    #[error("cannot broadcast {from:?} to {to:?}")]
    Broadcast {
        /// Source shape.
        from: Vec<usize>,
        /// Target shape.
        to: Vec<usize>,
    },
    /// Split points must be strictly increasing and inside the axis.
    #[error("split indices {indices:?} are invalid for an axis of length {len}")]
    SplitIndices {
        /// Requested split points.
        indices: Vec<usize>,
        /// Axis length.
        len: usize,
    },
    /// Multi-index outside the shape.
    #[error("index {index:?} (batch {batch}) is out of range for shape {shape:?} x {batch_count}")]
    IndexOutOfRange {
        /// Requested index.
        index: Vec<usize>,
        /// Requested batch.
        batch: usize,
        /// Tensor shape.
        shape: Vec<usize>,
        /// Tensor batch count.
        batch_count: usize,
    },
    /// Wrong number of inputs for an operation.
    #[error("`{function}` expects {expected} input(s), got {actual}")]
    Arity {
        /// Operation name.
        function: String,
        /// Human readable expectation, e.g. `2` or `at least 1`.
        expected: String,
        /// Inputs supplied.
        actual: usize,
    },
}

/// Graph-consistency errors. These indicate a construction bug.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Backward reached an operation without a matching forward record.
    #[error("`{function}` has no recorded forward call matching this backward call")]
    MissingRecord {
        /// Operation name.
        function: String,
    },
    /// An input port was neither a graph input nor produced earlier.
    #[error("`{function}` reads port `{port}` which is not produced by any earlier operation")]
    UnknownPort {
        /// Operation name.
        function: String,
        /// Port name.
        port: String,
    },
    /// Two operations write the same port.
    #[error("`{function}` writes port `{port}` which is already taken")]
    DuplicatePort {
        /// Operation name.
        function: String,
        /// Port name.
        port: String,
    },
    /// Container has no operations.
    #[error("container `{0}` is empty")]
    EmptyContainer(String),
    /// A port had no value when execution needed it.
    #[error("container `{container}` could not resolve port `{port}`")]
    UnresolvedPort {
        /// Container name.
        container: String,
        /// Port name.
        port: String,
    },
}

/// Accelerator failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The kernel manager was never initialized or found no device.
    #[error("no accelerator is available")]
    Unavailable,
    /// No adapter matched the requested device class.
    #[error("no adapter matches device class {0}")]
    NoAdapter(String),
    /// Adapter or device request failed.
    #[error("device request failed: {0}")]
    Request(String),
    /// Double precision was requested on a device without `SHADER_F64`.
    #[error("device does not support {0} precision kernels")]
    UnsupportedPrecision(&'static str),
    /// The source provider has no kernel with this name.
    #[error("kernel source `{0}` not found")]
    SourceNotFound(String),
    /// Kernel failed to compile; the generated source is attached.
    #[error("failed to compile kernel `{label}`: {message}")]
    Compile {
        /// Program label.
        label: String,
        /// Compiler diagnostics.
        message: String,
        /// Full generated source text.
        code: String,
    },
    /// Dispatch or readback failed.
    #[error("kernel dispatch failed: {0}")]
    Dispatch(String),
}

/// Model persistence failures.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Underlying I/O error.
    #[error("model i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// Magic or version mismatch.
    #[error("invalid model header")]
    InvalidHeader,
    /// Stored checksum differs from the computed one.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum {
        /// Checksum in the file.
        stored: u32,
        /// Checksum of the payload.
        computed: u32,
    },
    /// File ended early.
    #[error("model data is truncated")]
    Truncated,
    /// A count or length does not fit its field in the format.
    #[error("{what} of {value} does not fit the model format")]
    TooLarge {
        /// Which field overflowed.
        what: &'static str,
        /// Value that was rejected.
        value: usize,
    },
    /// No constructor registered for this kind tag.
    #[error("unknown operation kind `{0}`")]
    UnknownKind(String),
    /// Descriptor is inconsistent with its kind.
    #[error("malformed `{kind}` descriptor: {reason}")]
    InvalidDescriptor {
        /// Kind tag.
        kind: String,
        /// What is wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn compile_error_carries_the_generated_code() {
        let e = Error::from(DeviceError::Compile {
            label: "linear_relu".into(),
            message: "unknown identifier `Real`".into(),
            code: "fn main() {}".into(),
        });
        assert_eq!(
            e.to_string(),
            "failed to compile kernel `linear_relu`: unknown identifier `Real`"
        );
        assert!(e.source().is_none());
        match e {
            Error::Device(DeviceError::Compile { code, .. }) => assert_eq!(code, "fn main() {}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn io_errors_keep_their_cause() {
        let e = Error::from(ModelError::from(std::io::Error::other("disk gone")));
        assert!(e.source().is_some());
    }
}
