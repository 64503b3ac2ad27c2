//! Elementwise arithmetic on equally shaped operands.

use crate::error::{Result, ShapeError};
use crate::function::{Arity, Function, FunctionCore};
use crate::ops::cpu;
use crate::tensors::NdArray;

fn check_same(op: &str, xs: &[NdArray]) -> Result<()> {
    let first = &xs[0];
    for x in &xs[1..] {
        if x.shape() != first.shape() || x.batch_count() != first.batch_count() {
            return Err(ShapeError::Mismatch {
                op: op.to_string(),
                left: first.shape(),
                right: x.shape(),
            }
            .into());
        }
    }
    Ok(())
}

/// `a + b`.
pub struct Add {
    core: FunctionCore,
}

impl Add {
    /// New adder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: FunctionCore::new(name),
        }
    }
}

impl Function for Add {
    core_accessors!();

    fn kind(&self) -> &'static str {
        "add"
    }

    fn arity(&self) -> Arity {
        Arity::Dual
    }

    fn forward(&mut self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        check_same(&self.core.name, xs)?;
        let out = cpu::add(&xs[0].data(), &xs[1].data());
        Ok(vec![NdArray::from_batch(&xs[0].shape(), xs[0].batch_count(), out)?])
    }

    fn backward(&mut self, _output: usize, y: &NdArray, xs: &[NdArray]) -> Result<()> {
        let gy = y.grad_to_vec();
        for x in xs {
            x.accumulate_grad(&gy)?;
        }
        Ok(())
    }
}

/// `a * b`, elementwise.
pub struct Mul {
    core: FunctionCore,
}

impl Mul {
    /// New multiplier.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: FunctionCore::new(name),
        }
    }
}

impl Function for Mul {
    core_accessors!();

    fn kind(&self) -> &'static str {
        "mul"
    }

    fn arity(&self) -> Arity {
        Arity::Dual
    }

    fn forward(&mut self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        check_same(&self.core.name, xs)?;
        let out = cpu::mul(&xs[0].data(), &xs[1].data());
        Ok(vec![NdArray::from_batch(&xs[0].shape(), xs[0].batch_count(), out)?])
    }

    fn backward(&mut self, _output: usize, y: &NdArray, xs: &[NdArray]) -> Result<()> {
        // both contributions are computed before either is written, so `x * x`
        // reads the original values
        let (ga, gb) = {
            let gy = y.grad();
            (cpu::mul(&gy, &xs[1].data()), cpu::mul(&gy, &xs[0].data()))
        };
        xs[0].accumulate_grad(&ga)?;
        xs[1].accumulate_grad(&gb)
    }
}

/// Sum of any number of operands; used to merge branches.
pub struct AddN {
    core: FunctionCore,
}

impl AddN {
    /// New n-ary adder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: FunctionCore::new(name),
        }
    }
}

impl Function for AddN {
    core_accessors!();

    fn kind(&self) -> &'static str {
        "add_n"
    }

    fn arity(&self) -> Arity {
        Arity::Multi
    }

    fn forward(&mut self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        check_same(&self.core.name, xs)?;
        let mut acc = xs[0].to_vec();
        for x in &xs[1..] {
            acc = cpu::add(&acc, &x.data());
        }
        Ok(vec![NdArray::from_batch(&xs[0].shape(), xs[0].batch_count(), acc)?])
    }

    fn backward(&mut self, _output: usize, y: &NdArray, xs: &[NdArray]) -> Result<()> {
        let gy = y.grad_to_vec();
        for x in xs {
            x.accumulate_grad(&gy)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FunctionRef;

    fn vec1(v: &[crate::Real]) -> NdArray {
        NdArray::from_vec(&[v.len()], v.to_vec()).unwrap()
    }

    #[test]
    fn mul_gradients_swap_operands() {
        let a = vec1(&[2.0, 3.0]);
        let b = vec1(&[5.0, -1.0]);
        let y = FunctionRef::new(Mul::new("mul")).forward(&[a.clone(), b.clone()]).unwrap().remove(0);
        assert_eq!(y.to_vec(), vec![10.0, -3.0]);
        y.backward().unwrap();
        assert_eq!(a.grad_to_vec(), vec![5.0, -1.0]);
        assert_eq!(b.grad_to_vec(), vec![2.0, 3.0]);
    }

    #[test]
    fn add_n_rejects_mismatched_shapes() {
        let f = FunctionRef::new(AddN::new("merge"));
        let err = f.forward(&[vec1(&[1.0, 2.0]), vec1(&[1.0])]).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Shape(ShapeError::Mismatch { ref op, .. }) if op == "merge"
        ));
        assert!(f.forward(&[]).is_err());
    }

    #[test]
    fn add_n_sends_gradient_to_every_operand() {
        let xs = [vec1(&[1.0]), vec1(&[2.0]), vec1(&[3.0])];
        let y = FunctionRef::new(AddN::new("sum3")).forward(&xs).unwrap().remove(0);
        assert_eq!(y.to_vec(), vec![6.0]);
        y.backward().unwrap();
        for x in &xs {
            assert_eq!(x.grad_to_vec(), vec![1.0]);
        }
    }
}
