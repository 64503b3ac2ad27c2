use super::{fuse_pair, set_device_enable_all};
use crate::backprop;
use crate::device::KernelManager;
use crate::error::{GraphError, Result};
use crate::function::{Function, FunctionRef};
use crate::optim::OptimizerFactory;
use crate::tensors::NdArray;
use tracing::debug;

/// Ordered chain of operations; each output feeds the next input.
#[derive(Debug)]
pub struct FunctionStack {
    name: String,
    functions: Vec<FunctionRef>,
}

impl FunctionStack {
    /// Empty stack.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    /// Stack over existing handles.
    pub fn from_functions(name: impl Into<String>, functions: Vec<FunctionRef>) -> Self {
        Self {
            name: name.into(),
            functions,
        }
    }

    /// Appends an operation and returns its handle.
    pub fn push<F: Function + 'static>(&mut self, function: F) -> FunctionRef {
        let f = FunctionRef::new(function);
        self.functions.push(f.clone());
        f
    }

    /// Appends an existing handle. The same handle may appear more than once.
    pub fn push_ref(&mut self, function: FunctionRef) {
        self.functions.push(function);
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Members in execution order.
    #[must_use]
    pub fn functions(&self) -> &[FunctionRef] {
        &self.functions
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the stack has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Folds `xs` through every member, left to right.
    ///
    /// # Errors
    ///
    /// [`GraphError::EmptyContainer`] for an empty stack, or the first
    /// member error.
    pub fn forward(&self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        if self.functions.is_empty() {
            return Err(GraphError::EmptyContainer(self.name.clone()).into());
        }
        let mut current = xs.to_vec();
        for f in &self.functions {
            current = f.forward(&current)?;
        }
        Ok(current)
    }

    /// Inference form of [`forward`](Self::forward): no invocation is
    /// recorded and no input gains a consumer.
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward).
    pub fn predict(&self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        if self.functions.is_empty() {
            return Err(GraphError::EmptyContainer(self.name.clone()).into());
        }
        self.functions.iter().try_fold(xs.to_vec(), |current, f| f.predict(&current))
    }

    /// Propagates the gradients already stored on `ys`.
    ///
    /// Seed them first, with a loss from [`loss`](crate::loss) or by filling
    /// the gradient buffers directly.
    ///
    /// # Errors
    ///
    /// Graph errors for unmatched invocations, or member backward errors.
    pub fn backward(&self, ys: &[NdArray]) -> Result<()> {
        for y in ys {
            backprop::propagate(y)?;
        }
        Ok(())
    }

    /// Runs every member's update in order.
    ///
    /// # Errors
    ///
    /// The first optimizer error.
    pub fn update(&self) -> Result<()> {
        for f in &self.functions {
            f.update()?;
        }
        Ok(())
    }

    /// Drops pending invocation records on every member.
    pub fn reset_state(&self) {
        for f in &self.functions {
            f.reset_state();
        }
    }

    /// Installs a fresh optimizer from `factory` on every member.
    pub fn set_optimizer(&self, factory: OptimizerFactory<'_>) {
        for f in &self.functions {
            f.set_optimizer(factory());
        }
    }

    /// Toggles device execution on every capable member.
    ///
    /// Returns `true` only if every capable member accepted; members that
    /// refused keep running on the CPU.
    pub fn set_device_enable(&self, enable: bool, manager: &KernelManager) -> bool {
        set_device_enable_all(&self.functions, enable, manager)
    }

    /// Learnable tensors of every member, in order.
    #[must_use]
    pub fn parameters(&self) -> Vec<NdArray> {
        self.functions.iter().flat_map(|f| f.borrow().parameters()).collect()
    }

    /// Single left-to-right pass fusing each fusible member with the
    /// activation right after it. Returns the number of fused pairs.
    ///
    /// After a fusion the scan resumes after the removed activation, so a
    /// pair is only examined once.
    pub fn compress(&mut self) -> usize {
        let mut fused = 0;
        let mut i = 0;
        while i + 1 < self.functions.len() {
            if fuse_pair(&self.functions[i], &self.functions[i + 1]) {
                let removed = self.functions.remove(i + 1);
                debug!(container = %self.name, absorbed = %removed.name(), into = %self.functions[i].name(), "fused");
                fused += 1;
            }
            i += 1;
        }
        fused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{Activation, ActivationKind, Linear};

    #[test]
    fn empty_stack_refuses_forward() {
        let s = FunctionStack::new("empty");
        let x = NdArray::new(&[1], 1).unwrap();
        assert!(matches!(
            s.forward(&[x]),
            Err(crate::Error::Graph(GraphError::EmptyContainer(_)))
        ));
    }

    #[test]
    fn compress_is_a_single_pass() {
        let mut s = FunctionStack::new("net");
        s.push(Linear::new("l1", 2, 2).unwrap());
        s.push(Activation::new("a1", ActivationKind::Relu));
        s.push(Activation::new("a2", ActivationKind::Tanh));
        s.push(Linear::new("l2", 2, 2).unwrap());
        s.push(Activation::new("a3", ActivationKind::Sigmoid));
        assert_eq!(s.compress(), 2);
        let names: Vec<String> = s.functions().iter().map(FunctionRef::name).collect();
        assert_eq!(names, ["l1", "a2", "l2"]);
        assert_eq!(s.compress(), 0);
    }

    #[test]
    fn pending_records_block_fusion() {
        let mut s = FunctionStack::new("net");
        s.push(Linear::new("l1", 2, 2).unwrap());
        s.push(Activation::new("a1", ActivationKind::Relu));
        let y = s.forward(&[NdArray::new(&[2], 1).unwrap()]).unwrap();
        assert_eq!(s.compress(), 0);
        s.backward(&y).unwrap();
        assert_eq!(s.compress(), 1);
    }

    #[test]
    fn predict_leaves_no_records() {
        let mut s = FunctionStack::new("net");
        s.push(Linear::seeded("l1", 2, 3, 7).unwrap());
        s.push(Activation::new("a1", ActivationKind::Tanh));
        let x = NdArray::from_vec(&[2], vec![0.5, -1.0]).unwrap();

        for _ in 0..1000 {
            s.predict(&[x.clone()]).unwrap();
        }
        assert!(s.functions().iter().all(|f| f.pending() == 0));
        assert_eq!(x.use_count(), 0);

        let inferred = s.predict(&[x.clone()]).unwrap();
        assert_eq!(inferred[0].parent_name(), None);
        let trained = s.forward(&[x.clone()]).unwrap();
        assert_eq!(inferred[0].to_vec(), trained[0].to_vec());
        assert_eq!(trained[0].parent_name().as_deref(), Some("a1"));
        s.reset_state();

        assert_eq!(s.compress(), 1);
        let fused = s.predict(&[x]).unwrap();
        assert!(crate::approx::approx_eq(&fused[0].to_vec()[..], &trained[0].to_vec()[..]));
    }
}
