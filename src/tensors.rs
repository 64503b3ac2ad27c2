//! Core tensor value and its graph bookkeeping.
//!
//! # Tensor Values
//!
//! An [`NdArray`] is a shared handle to an n-dimensional array of [`Real`]s
//! together with:
//!
//! - a gradient buffer of the same length, zeroed on construction
//! - a per-instance `shape` and a `batch_count` of stacked instances
//! - a `use_count` of recorded consumers that have not yet sent gradients back
//! - a `train_count` of backward passes accumulated since the last clear
//! - the operation invocation that produced it, if any
//!
//! ## Layout
//!
//! Buffers are batch-major, then row-major inside each batch instance. The
//! offset of `(batch, index)` is
//! `batch * len + sum(index[d] * prod(shape[d+1..]))`, computed by
//! [`local_index`]. Every operation in this crate addresses tensors through
//! that formula, CPU and device paths alike.
//!
//! ## Handles
//!
//! `Clone` copies the handle, not the buffers. Use [`NdArray::deep_clone`]
//! for an independent copy.
//!
//! ## Example
//!
//! ```rust
//! use briny_grad::NdArray;
//!
//! let t = NdArray::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
//! let s = t.sum(&[]).unwrap();
//! assert_eq!(s.to_vec(), vec![21.0]);
//! ```

use crate::error::{Result, ShapeError};
use crate::function::Producer;
use crate::functions::structural::{Broadcast, Concat, SplitAxis, SumAxes};
use crate::{FunctionRef, Real};
use core::fmt;
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

/// Shared handle to a tensor value and its gradient.
#[derive(Clone)]
pub struct NdArray(Rc<RefCell<ArrayCell>>);

struct ArrayCell {
    data: Vec<Real>,
    grad: Vec<Real>,
    shape: Vec<usize>,
    batch_count: usize,
    use_count: usize,
    train_count: usize,
    parent: Option<Producer>,
}

/// Checks a shape and batch count, returning the per-instance length.
///
/// The whole buffer length must also fit in `usize`.
pub(crate) fn checked_len(shape: &[usize], batch_count: usize) -> core::result::Result<usize, ShapeError> {
    checked_total(shape, batch_count).map(|total| total / batch_count)
}

/// Like [`checked_len`], returning the length across all batch instances.
pub(crate) fn checked_total(shape: &[usize], batch_count: usize) -> core::result::Result<usize, ShapeError> {
    let invalid = || ShapeError::InvalidDimension {
        shape: shape.to_vec(),
        batch_count,
    };
    if batch_count == 0 || shape.contains(&0) {
        return Err(invalid());
    }
    shape
        .iter()
        .try_fold(batch_count, |acc, &d| acc.checked_mul(d))
        .ok_or_else(invalid)
}

/// Flat offset of `index` inside batch instance `batch`.
///
/// # Errors
///
/// Returns [`ShapeError::IndexOutOfRange`] if the rank differs or any
/// coordinate (or the batch) is out of bounds.
pub fn local_index(
    shape: &[usize],
    batch_count: usize,
    batch: usize,
    index: &[usize],
) -> core::result::Result<usize, ShapeError> {
    if index.len() != shape.len()
        || batch >= batch_count
        || index.iter().zip(shape).any(|(i, d)| i >= d)
    {
        return Err(ShapeError::IndexOutOfRange {
            index: index.to_vec(),
            batch,
            shape: shape.to_vec(),
            batch_count,
        });
    }
    let len: usize = shape.iter().product();
    let offset = index.iter().zip(shape).fold(0, |acc, (i, d)| acc * d + i);
    Ok(batch * len + offset)
}

/// Splits a shape around `axis` into `(outer, axis_len, inner)` block sizes.
pub(crate) fn axis_blocks(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    (outer, shape[axis], inner)
}

impl NdArray {
    /// Zero-filled value and gradient buffers.
    ///
    /// # Errors
    ///
    /// Fails if any dimension or the batch count is zero.
    pub fn new(shape: &[usize], batch_count: usize) -> Result<Self> {
        Self::filled(shape, batch_count, 0.0)
    }

    /// Buffers filled with `value`; the gradient is still zero.
    ///
    /// # Errors
    ///
    /// Fails if any dimension or the batch count is zero.
    pub fn filled(shape: &[usize], batch_count: usize, value: Real) -> Result<Self> {
        let total = checked_total(shape, batch_count)?;
        Self::from_batch(shape, batch_count, vec![value; total])
    }

    /// Single-instance tensor over existing data.
    ///
    /// # Errors
    ///
    /// Fails if the shape is invalid or `data` has the wrong length.
    pub fn from_vec(shape: &[usize], data: Vec<Real>) -> Result<Self> {
        Self::from_batch(shape, 1, data)
    }

    /// Batched tensor over existing data, laid out batch-major.
    ///
    /// # Errors
    ///
    /// Fails if the shape is invalid or `data` has the wrong length.
    pub fn from_batch(shape: &[usize], batch_count: usize, data: Vec<Real>) -> Result<Self> {
        let total = checked_total(shape, batch_count)?;
        if data.len() != total {
            return Err(ShapeError::DataLength {
                shape: shape.to_vec(),
                batch_count,
                expected: total,
                actual: data.len(),
            }
            .into());
        }
        let grad = vec![0.0; data.len()];
        Ok(Self(Rc::new(RefCell::new(ArrayCell {
            data,
            grad,
            shape: shape.to_vec(),
            batch_count,
            use_count: 0,
            train_count: 0,
            parent: None,
        }))))
    }

    /// Per-instance shape (batch axis excluded).
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().shape.clone()
    }

    /// Number of stacked batch instances.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.0.borrow().batch_count
    }

    /// Elements in one batch instance.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.borrow().shape.iter().product()
    }

    /// Always `false`: zero-sized dimensions are rejected at construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.borrow().data.is_empty()
    }

    /// Elements across all batch instances.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.0.borrow().data.len()
    }

    /// Borrows the value buffer.
    #[must_use]
    pub fn data(&self) -> Ref<'_, [Real]> {
        Ref::map(self.0.borrow(), |c| c.data.as_slice())
    }

    /// Mutably borrows the value buffer.
    #[must_use]
    pub fn data_mut(&self) -> RefMut<'_, [Real]> {
        RefMut::map(self.0.borrow_mut(), |c| c.data.as_mut_slice())
    }

    /// Borrows the gradient buffer.
    #[must_use]
    pub fn grad(&self) -> Ref<'_, [Real]> {
        Ref::map(self.0.borrow(), |c| c.grad.as_slice())
    }

    /// Mutably borrows the gradient buffer.
    #[must_use]
    pub fn grad_mut(&self) -> RefMut<'_, [Real]> {
        RefMut::map(self.0.borrow_mut(), |c| c.grad.as_mut_slice())
    }

    /// Copy of the value buffer.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Real> {
        self.0.borrow().data.clone()
    }

    /// Copy of the gradient buffer.
    #[must_use]
    pub fn grad_to_vec(&self) -> Vec<Real> {
        self.0.borrow().grad.clone()
    }

    /// Recorded consumers that still owe a gradient contribution.
    #[must_use]
    pub fn use_count(&self) -> usize {
        self.0.borrow().use_count
    }

    /// Backward passes accumulated since the last [`clear_grad`](Self::clear_grad).
    #[must_use]
    pub fn train_count(&self) -> usize {
        self.0.borrow().train_count
    }

    /// Whether an operation produced this value.
    #[must_use]
    pub fn has_parent(&self) -> bool {
        self.0.borrow().parent.is_some()
    }

    /// Name of the producing operation.
    #[must_use]
    pub fn parent_name(&self) -> Option<String> {
        self.0.borrow().parent.as_ref().map(|p| p.function.name())
    }

    /// Whether both handles point at the same buffers.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Zeroes the gradient and resets `train_count`.
    pub fn clear_grad(&self) {
        let mut cell = self.0.borrow_mut();
        cell.grad.fill(0.0);
        cell.train_count = 0;
    }

    /// Reinterprets the buffer with a new per-instance shape.
    ///
    /// One entry may be `-1`, which is inferred from the element count.
    ///
    /// # Errors
    ///
    /// Fails on more than one `-1`, on zero or other negative entries, and when
    /// element counts do not match.
    pub fn reshape(&self, shape: &[isize]) -> Result<()> {
        let len = self.len();
        let mut wildcard = None;
        let mut known = 1usize;
        for (i, &d) in shape.iter().enumerate() {
            if d == -1 {
                if wildcard.replace(i).is_some() {
                    return Err(ShapeError::MultipleWildcards(shape.to_vec()).into());
                }
            } else if d <= 0 {
                return Err(ShapeError::InvalidWildcard(shape.to_vec()).into());
            } else {
                known *= d as usize;
            }
        }

        let mismatch = || ShapeError::ElementCount {
            from: self.shape(),
            to: shape.to_vec(),
        };
        let mut resolved: Vec<usize> = shape.iter().map(|&d| d.max(1) as usize).collect();
        match wildcard {
            Some(w) => {
                if len % known != 0 {
                    return Err(mismatch().into());
                }
                resolved[w] = len / known;
            }
            None if known != len => return Err(mismatch().into()),
            None => {}
        }

        self.0.borrow_mut().shape = resolved;
        Ok(())
    }

    /// Flat offset of `index` in batch instance `batch`; see [`local_index`].
    ///
    /// # Errors
    ///
    /// Fails if the index is out of range.
    pub fn local_index(&self, batch: usize, index: &[usize]) -> Result<usize> {
        let cell = self.0.borrow();
        Ok(local_index(&cell.shape, cell.batch_count, batch, index)?)
    }

    /// Sums over `axes` (all axes if empty), per batch instance.
    ///
    /// Summed axes are removed; summing everything leaves a rank-0 value.
    /// The result is differentiable: its gradient scatters back to every
    /// contributing element.
    ///
    /// # Errors
    ///
    /// Fails on out-of-range or duplicate axes.
    pub fn sum(&self, axes: &[usize]) -> Result<Self> {
        let f = FunctionRef::new(SumAxes::new(axes.to_vec()));
        first(f.forward(&[self.clone()])?)
    }

    /// Splits along `axis` at the given points, like `numpy.split`.
    ///
    /// `[2, 5]` on an axis of 7 yields slices `0..2`, `2..5` and `5..7`.
    ///
    /// # Errors
    ///
    /// Fails if the axis is out of range or the points are not strictly
    /// increasing inside `1..len`.
    pub fn split(&self, indices: &[usize], axis: usize) -> Result<Vec<Self>> {
        let f = FunctionRef::new(SplitAxis::new("split", indices.to_vec(), axis));
        f.forward(&[self.clone()])
    }

    /// Joins `a` and `b` along `axis`.
    ///
    /// # Errors
    ///
    /// Fails if ranks, batch counts or off-axis dimensions differ.
    pub fn concatenate(a: &Self, b: &Self, axis: usize) -> Result<Self> {
        let f = FunctionRef::new(Concat::new("concat", axis));
        first(f.forward(&[a.clone(), b.clone()])?)
    }

    /// Broadcasts to `target` following trailing-axis alignment.
    ///
    /// # Errors
    ///
    /// Fails if any source dimension is neither `1` nor equal to the target.
    pub fn broadcast(&self, target: &[usize]) -> Result<Self> {
        let f = FunctionRef::new(Broadcast::new(target.to_vec()));
        first(f.forward(&[self.clone()])?)
    }

    /// Seeds the gradient with ones and runs the backward traversal.
    ///
    /// # Errors
    ///
    /// Propagates any error from the operations on the producer chain.
    pub fn backward(&self) -> Result<()> {
        self.0.borrow_mut().grad.fill(1.0);
        crate::backprop::propagate(self)
    }

    /// Independent copy of both buffers.
    ///
    /// The producer reference is copied as-is; the upstream graph is shared,
    /// not duplicated.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        let cell = self.0.borrow();
        Self(Rc::new(RefCell::new(ArrayCell {
            data: cell.data.clone(),
            grad: cell.grad.clone(),
            shape: cell.shape.clone(),
            batch_count: cell.batch_count,
            use_count: 0,
            train_count: cell.train_count,
            parent: cell.parent.clone(),
        })))
    }

    /// Adds `delta` into the gradient buffer.
    pub(crate) fn accumulate_grad(&self, delta: &[Real]) -> Result<()> {
        let mut cell = self.0.borrow_mut();
        if delta.len() != cell.grad.len() {
            return Err(ShapeError::DataLength {
                shape: cell.shape.clone(),
                batch_count: cell.batch_count,
                expected: cell.grad.len(),
                actual: delta.len(),
            }
            .into());
        }
        for (g, d) in cell.grad.iter_mut().zip(delta) {
            *g += d;
        }
        Ok(())
    }

    /// Divides the gradient by `train_count`, if any passes were accumulated.
    pub(crate) fn average_grad(&self) {
        let mut cell = self.0.borrow_mut();
        if cell.train_count > 1 {
            let scale = 1.0 / cell.train_count as Real;
            for g in &mut cell.grad {
                *g *= scale;
            }
        }
    }

    pub(crate) fn bump_train_count(&self) {
        self.0.borrow_mut().train_count += 1;
    }

    pub(crate) fn retain(&self) {
        self.0.borrow_mut().use_count += 1;
    }

    /// Drops one pending consumer and returns the remaining count.
    pub(crate) fn release(&self) -> usize {
        let mut cell = self.0.borrow_mut();
        cell.use_count = cell.use_count.saturating_sub(1);
        cell.use_count
    }

    pub(crate) fn parent(&self) -> Option<Producer> {
        self.0.borrow().parent.clone()
    }

    pub(crate) fn set_parent(&self, producer: Producer) {
        self.0.borrow_mut().parent = Some(producer);
    }
}

fn first(mut outputs: Vec<NdArray>) -> Result<NdArray> {
    // structural functions always yield one output here
    debug_assert_eq!(outputs.len(), 1);
    Ok(outputs.swap_remove(0))
}

impl fmt::Debug for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.0.borrow();
        f.debug_struct("NdArray")
            .field("shape", &cell.shape)
            .field("batch_count", &cell.batch_count)
            .field("data", &cell.data)
            .field("grad", &cell.grad)
            .field("use_count", &cell.use_count)
            .field("parent", &cell.parent.as_ref().map(|p| p.function.name()))
            .finish()
    }
}
