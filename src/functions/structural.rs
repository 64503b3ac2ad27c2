//! Structural tensor algebra: reduce, split, join and broadcast.
//!
//! These move values around without arithmetic beyond summation. Each pair
//! is the other's backward: summing scatters the gradient back, splitting
//! concatenates the slice gradients, and broadcasting sums over the expanded
//! axes.

use crate::Real;
use crate::error::{ModelError, Result, ShapeError};
use crate::function::{Arity, Function, FunctionCore};
use crate::tensors::{NdArray, axis_blocks, checked_len, checked_total};

fn check_axis(axis: usize, rank: usize) -> core::result::Result<(), ShapeError> {
    if axis >= rank {
        return Err(ShapeError::AxisOutOfRange { axis, rank });
    }
    Ok(())
}

/// For every element of `shape`, the flat index in the shape that keeps only
/// the axes flagged in `keep`.
fn reduction_map(shape: &[usize], keep: &[bool]) -> Vec<usize> {
    let len: usize = shape.iter().product();
    (0..len)
        .map(|flat| {
            let (mut rem, mut out, mut stride) = (flat, 0, 1);
            for d in (0..shape.len()).rev() {
                let coord = rem % shape[d];
                rem /= shape[d];
                if keep[d] {
                    out += coord * stride;
                    stride *= shape[d];
                }
            }
            out
        })
        .collect()
}

/// `dst[b][map[i]] += src[b][i]` for every batch instance.
fn scatter_add(src: &[Real], map: &[usize], dst_len: usize, batch_count: usize) -> Vec<Real> {
    let src_len = map.len();
    let mut dst = vec![0.0; dst_len * batch_count];
    for b in 0..batch_count {
        for (i, &m) in map.iter().enumerate() {
            dst[b * dst_len + m] += src[b * src_len + i];
        }
    }
    dst
}

/// `dst[b][i] = src[b][map[i]]` for every batch instance.
fn gather(src: &[Real], map: &[usize], src_len: usize, batch_count: usize) -> Vec<Real> {
    let mut dst = Vec::with_capacity(map.len() * batch_count);
    for b in 0..batch_count {
        dst.extend(map.iter().map(|&m| src[b * src_len + m]));
    }
    dst
}

fn usize_attrs(kind: &str, attrs: &[i64]) -> core::result::Result<Vec<usize>, ModelError> {
    attrs
        .iter()
        .map(|&a| {
            usize::try_from(a).map_err(|_| ModelError::InvalidDescriptor {
                kind: kind.to_string(),
                reason: format!("negative attribute {a}"),
            })
        })
        .collect()
}

/// Sum over a set of axes; an empty set means every axis.
pub struct SumAxes {
    core: FunctionCore,
    axes: Vec<usize>,
}

impl SumAxes {
    /// Reduction over `axes`.
    #[must_use]
    pub fn new(axes: Vec<usize>) -> Self {
        Self {
            core: FunctionCore::new("sum"),
            axes,
        }
    }

    pub(crate) fn from_attributes(name: &str, attrs: &[i64]) -> core::result::Result<Self, ModelError> {
        let mut f = Self::new(usize_attrs("sum", attrs)?);
        f.core.name = name.to_string();
        Ok(f)
    }

    fn keep_mask(&self, rank: usize) -> Result<Vec<bool>> {
        if self.axes.is_empty() {
            return Ok(vec![false; rank]);
        }
        let mut keep = vec![true; rank];
        for &axis in &self.axes {
            check_axis(axis, rank)?;
            if !keep[axis] {
                return Err(ShapeError::DuplicateAxis(axis).into());
            }
            keep[axis] = false;
        }
        Ok(keep)
    }
}

impl Function for SumAxes {
    core_accessors!();

    fn kind(&self) -> &'static str {
        "sum"
    }

    fn arity(&self) -> Arity {
        Arity::Single
    }

    fn forward(&mut self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        let x = &xs[0];
        let shape = x.shape();
        let keep = self.keep_mask(shape.len())?;
        let out_shape: Vec<usize> = shape
            .iter()
            .zip(&keep)
            .filter_map(|(&d, &k)| k.then_some(d))
            .collect();
        let out_len = out_shape.iter().product();
        let map = reduction_map(&shape, &keep);
        let out = scatter_add(&x.data(), &map, out_len, x.batch_count());
        Ok(vec![NdArray::from_batch(&out_shape, x.batch_count(), out)?])
    }

    fn backward(&mut self, _output: usize, y: &NdArray, xs: &[NdArray]) -> Result<()> {
        let x = &xs[0];
        let shape = x.shape();
        let keep = self.keep_mask(shape.len())?;
        let map = reduction_map(&shape, &keep);
        let gx = gather(&y.grad(), &map, y.len(), x.batch_count());
        x.accumulate_grad(&gx)
    }

    fn attributes(&self) -> Vec<i64> {
        self.axes.iter().map(|&a| a as i64).collect()
    }
}

/// Broadcast to a target shape, aligning trailing axes.
pub struct Broadcast {
    core: FunctionCore,
    target: Vec<usize>,
}

impl Broadcast {
    /// Broadcast to `target`.
    #[must_use]
    pub fn new(target: Vec<usize>) -> Self {
        Self {
            core: FunctionCore::new("broadcast"),
            target,
        }
    }

    pub(crate) fn from_attributes(name: &str, attrs: &[i64]) -> core::result::Result<Self, ModelError> {
        let mut f = Self::new(usize_attrs("broadcast", attrs)?);
        f.core.name = name.to_string();
        Ok(f)
    }

    /// For every target element, the source element it copies.
    fn source_map(&self, source: &[usize]) -> Result<Vec<usize>> {
        let fail = || ShapeError::Broadcast {
            from: source.to_vec(),
            to: self.target.clone(),
        };
        if source.len() > self.target.len() {
            return Err(fail().into());
        }
        let offset = self.target.len() - source.len();
        if source
            .iter()
            .zip(&self.target[offset..])
            .any(|(&s, &t)| s != t && s != 1)
        {
            return Err(fail().into());
        }

        let len = checked_len(&self.target, 1)?;
        Ok((0..len)
            .map(|flat| {
                let (mut rem, mut src, mut stride) = (flat, 0, 1);
                for d in (0..self.target.len()).rev() {
                    let coord = rem % self.target[d];
                    rem /= self.target[d];
                    if d >= offset {
                        let s = source[d - offset];
                        if s != 1 {
                            src += coord * stride;
                        }
                        stride *= s;
                    }
                }
                src
            })
            .collect())
    }
}

impl Function for Broadcast {
    core_accessors!();

    fn kind(&self) -> &'static str {
        "broadcast"
    }

    fn arity(&self) -> Arity {
        Arity::Single
    }

    fn forward(&mut self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        let x = &xs[0];
        checked_total(&self.target, x.batch_count())?;
        let map = self.source_map(&x.shape())?;
        let out = gather(&x.data(), &map, x.len(), x.batch_count());
        Ok(vec![NdArray::from_batch(&self.target, x.batch_count(), out)?])
    }

    fn backward(&mut self, _output: usize, y: &NdArray, xs: &[NdArray]) -> Result<()> {
        let x = &xs[0];
        let map = self.source_map(&x.shape())?;
        let gx = scatter_add(&y.grad(), &map, x.len(), x.batch_count());
        x.accumulate_grad(&gx)
    }

    fn attributes(&self) -> Vec<i64> {
        self.target.iter().map(|&d| d as i64).collect()
    }
}

/// Splits one input along an axis into several outputs.
pub struct SplitAxis {
    core: FunctionCore,
    indices: Vec<usize>,
    axis: usize,
}

impl SplitAxis {
    /// Split at `indices` along `axis`.
    pub fn new(name: impl Into<String>, indices: Vec<usize>, axis: usize) -> Self {
        Self {
            core: FunctionCore::new(name),
            indices,
            axis,
        }
    }

    pub(crate) fn from_attributes(name: &str, attrs: &[i64]) -> core::result::Result<Self, ModelError> {
        let mut values = usize_attrs("split", attrs)?;
        if values.is_empty() {
            return Err(ModelError::InvalidDescriptor {
                kind: "split".into(),
                reason: "missing axis".into(),
            });
        }
        let axis = values.remove(0);
        Ok(Self::new(name, values, axis))
    }

    /// Number of outputs produced per call.
    #[must_use]
    pub fn pieces(&self) -> usize {
        self.indices.len() + 1
    }

    /// `[start, end)` of every piece along the axis.
    fn bounds(&self, shape: &[usize]) -> Result<Vec<(usize, usize)>> {
        check_axis(self.axis, shape.len())?;
        let len = shape[self.axis];
        let valid = self.indices.windows(2).all(|w| w[0] < w[1])
            && self.indices.iter().all(|&i| i > 0 && i < len);
        if !valid {
            return Err(ShapeError::SplitIndices {
                indices: self.indices.clone(),
                len,
            }
            .into());
        }
        let mut edges = Vec::with_capacity(self.indices.len() + 2);
        edges.push(0);
        edges.extend_from_slice(&self.indices);
        edges.push(len);
        Ok(edges.windows(2).map(|w| (w[0], w[1])).collect())
    }
}

impl Function for SplitAxis {
    core_accessors!();

    fn kind(&self) -> &'static str {
        "split"
    }

    fn arity(&self) -> Arity {
        Arity::SingleInMultiOut
    }

    fn forward(&mut self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        let x = &xs[0];
        let shape = x.shape();
        let bounds = self.bounds(&shape)?;
        let (outer, len, inner) = axis_blocks(&shape, self.axis);
        let data = x.data();
        let total = x.len();

        let mut outputs = Vec::with_capacity(bounds.len());
        for (start, end) in bounds {
            let mut piece = Vec::with_capacity(outer * (end - start) * inner * x.batch_count());
            for b in 0..x.batch_count() {
                for o in 0..outer {
                    let base = b * total + o * len * inner;
                    piece.extend_from_slice(&data[base + start * inner..base + end * inner]);
                }
            }
            let mut piece_shape = shape.clone();
            piece_shape[self.axis] = end - start;
            outputs.push(NdArray::from_batch(&piece_shape, x.batch_count(), piece)?);
        }
        Ok(outputs)
    }

    fn backward(&mut self, output: usize, y: &NdArray, xs: &[NdArray]) -> Result<()> {
        let x = &xs[0];
        let shape = x.shape();
        let (start, end) = self.bounds(&shape)?[output];
        let (outer, len, inner) = axis_blocks(&shape, self.axis);
        let total = x.len();
        let width = (end - start) * inner;

        let gy = y.grad();
        let mut gx = vec![0.0; x.total_len()];
        for b in 0..x.batch_count() {
            for o in 0..outer {
                let dst = b * total + o * len * inner + start * inner;
                let src = (b * outer + o) * width;
                gx[dst..dst + width].copy_from_slice(&gy[src..src + width]);
            }
        }
        drop(gy);
        x.accumulate_grad(&gx)
    }

    fn attributes(&self) -> Vec<i64> {
        std::iter::once(self.axis)
            .chain(self.indices.iter().copied())
            .map(|v| v as i64)
            .collect()
    }
}

/// Joins two inputs along an axis.
pub struct Concat {
    core: FunctionCore,
    axis: usize,
}

impl Concat {
    /// Concatenation along `axis`.
    pub fn new(name: impl Into<String>, axis: usize) -> Self {
        Self {
            core: FunctionCore::new(name),
            axis,
        }
    }

    pub(crate) fn from_attributes(name: &str, attrs: &[i64]) -> core::result::Result<Self, ModelError> {
        match usize_attrs("concat", attrs)?.as_slice() {
            [axis] => Ok(Self::new(name, *axis)),
            other => Err(ModelError::InvalidDescriptor {
                kind: "concat".into(),
                reason: format!("expected one axis, got {other:?}"),
            }),
        }
    }

    fn check(&self, a: &NdArray, b: &NdArray) -> Result<()> {
        let (sa, sb) = (a.shape(), b.shape());
        check_axis(self.axis, sa.len())?;
        let compatible = sa.len() == sb.len()
            && a.batch_count() == b.batch_count()
            && sa
                .iter()
                .zip(&sb)
                .enumerate()
                .all(|(d, (x, y))| d == self.axis || x == y);
        if !compatible {
            return Err(ShapeError::Mismatch {
                op: self.core.name.clone(),
                left: sa,
                right: sb,
            }
            .into());
        }
        Ok(())
    }
}

impl Function for Concat {
    core_accessors!();

    fn kind(&self) -> &'static str {
        "concat"
    }

    fn arity(&self) -> Arity {
        Arity::Dual
    }

    fn forward(&mut self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        let (a, b) = (&xs[0], &xs[1]);
        self.check(a, b)?;
        let (outer, la, inner) = axis_blocks(&a.shape(), self.axis);
        let lb = b.shape()[self.axis];
        let (wa, wb) = (la * inner, lb * inner);
        let (da, db) = (a.data(), b.data());

        let mut out = Vec::with_capacity(a.total_len() + b.total_len());
        for batch in 0..a.batch_count() {
            for o in 0..outer {
                let pa = (batch * outer + o) * wa;
                let pb = (batch * outer + o) * wb;
                out.extend_from_slice(&da[pa..pa + wa]);
                out.extend_from_slice(&db[pb..pb + wb]);
            }
        }
        let mut shape = a.shape();
        shape[self.axis] = la + lb;
        Ok(vec![NdArray::from_batch(&shape, a.batch_count(), out)?])
    }

    fn backward(&mut self, _output: usize, y: &NdArray, xs: &[NdArray]) -> Result<()> {
        let (a, b) = (&xs[0], &xs[1]);
        let (outer, la, inner) = axis_blocks(&a.shape(), self.axis);
        let lb = b.shape()[self.axis];
        let (wa, wb) = (la * inner, lb * inner);

        let (ga, gb) = {
            let gy = y.grad();
            let mut ga = Vec::with_capacity(a.total_len());
            let mut gb = Vec::with_capacity(b.total_len());
            for row in gy.chunks(wa + wb).take(a.batch_count() * outer) {
                ga.extend_from_slice(&row[..wa]);
                gb.extend_from_slice(&row[wa..]);
            }
            (ga, gb)
        };
        a.accumulate_grad(&ga)?;
        b.accumulate_grad(&gb)
    }

    fn attributes(&self) -> Vec<i64> {
        vec![self.axis as i64]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(shape: &[usize]) -> NdArray {
        let len: usize = shape.iter().product();
        NdArray::from_vec(shape, (0..len).map(|v| v as Real).collect()).unwrap()
    }

    #[test]
    fn sum_over_one_axis() {
        let t = iota(&[2, 3]);
        assert_eq!(t.sum(&[0]).unwrap().to_vec(), vec![3.0, 5.0, 7.0]);
        assert_eq!(t.sum(&[1]).unwrap().to_vec(), vec![3.0, 12.0]);
        assert_eq!(t.sum(&[1]).unwrap().shape(), vec![2]);
        assert!(t.sum(&[2]).is_err());
        assert!(matches!(
            t.sum(&[1, 1]),
            Err(crate::Error::Shape(ShapeError::DuplicateAxis(1)))
        ));
    }

    #[test]
    fn sum_keeps_batches_apart() {
        let t = NdArray::from_batch(&[2], 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let s = t.sum(&[]).unwrap();
        assert_eq!(s.shape(), Vec::<usize>::new());
        assert_eq!(s.to_vec(), vec![3.0, 7.0]);
    }

    #[test]
    fn broadcast_row_and_reduce_back() {
        let row = NdArray::from_vec(&[3], vec![1.0, 2.0, 3.0]).unwrap();
        let grid = row.broadcast(&[2, 3]).unwrap();
        assert_eq!(grid.to_vec(), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        grid.backward().unwrap();
        assert_eq!(row.grad_to_vec(), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn broadcast_column() {
        let col = NdArray::from_vec(&[2, 1], vec![1.0, 2.0]).unwrap();
        let grid = col.broadcast(&[2, 3]).unwrap();
        assert_eq!(grid.to_vec(), vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert!(col.broadcast(&[3, 3]).is_err());
        assert!(col.broadcast(&[1]).is_err());
    }

    #[test]
    fn split_middle_axis() {
        let t = iota(&[2, 3, 2]);
        let parts = t.split(&[1], 1).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].shape(), vec![2, 1, 2]);
        assert_eq!(parts[0].to_vec(), vec![0.0, 1.0, 6.0, 7.0]);
        assert_eq!(parts[1].to_vec(), vec![2.0, 3.0, 4.0, 5.0, 8.0, 9.0, 10.0, 11.0]);
        assert!(t.split(&[0], 1).is_err());
        assert!(t.split(&[2, 1], 1).is_err());
        assert!(t.split(&[3], 1).is_err());
    }

    #[test]
    fn concat_rejects_off_axis_mismatch() {
        let a = iota(&[2, 3]);
        let b = iota(&[3, 2]);
        assert!(NdArray::concatenate(&a, &b, 0).is_err());
        assert!(NdArray::concatenate(&a, &b, 5).is_err());
        let c = NdArray::concatenate(&a, &iota(&[2, 1]), 1).unwrap();
        assert_eq!(c.to_vec(), vec![0.0, 1.0, 2.0, 0.0, 3.0, 4.0, 5.0, 1.0]);
    }
}
