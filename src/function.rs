//! The differentiable operation abstraction.
//!
//! Concrete operations implement [`Function`]: a pure `forward` from inputs to
//! outputs and a `backward` that accumulates into input gradients. Graph
//! wiring (arity checks, invocation records, consumer counts and producer
//! links) lives in [`FunctionRef::forward`], so every operation gets it for
//! free.
//!
//! Optional capabilities are separate traits reached through the
//! `as_*` accessors on [`Function`]:
//!
//! - [`DeviceAffine`]: can run its forward pass as a compiled device kernel
//! - [`Fusible`]: can absorb a following activation
//!
//! Learnable tensors are exposed through [`Function::parameters`].

use crate::device::{KernelManager, Program};
use crate::error::{GraphError, Result, ShapeError};
use crate::functions::ActivationKind;
use crate::optim::Optimizer;
use crate::tensors::NdArray;
use core::fmt;
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;
use tracing::{debug, warn};

/// Input/output cardinality of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// One input, one output.
    Single,
    /// Two inputs, one output.
    Dual,
    /// One or more inputs, one output.
    Multi,
    /// One input, several outputs.
    SingleInMultiOut,
}

impl Arity {
    /// Checks an input count against this arity.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeError::Arity`] naming `function` on mismatch.
    pub fn check(self, function: &str, actual: usize) -> core::result::Result<(), ShapeError> {
        let (ok, expected) = match self {
            Self::Single | Self::SingleInMultiOut => (actual == 1, "1"),
            Self::Dual => (actual == 2, "2"),
            Self::Multi => (actual >= 1, "at least 1"),
        };
        if ok {
            Ok(())
        } else {
            Err(ShapeError::Arity {
                function: function.to_string(),
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

/// Handle to one recorded forward invocation.
///
/// Stale handles (from a record that was already consumed or reset) never
/// alias a newer record: the slot generation must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    slot: usize,
    generation: u64,
}

struct Record {
    inputs: Vec<NdArray>,
    delivered: Vec<bool>,
    pending: usize,
}

struct Slot {
    generation: u64,
    record: Option<Record>,
}

/// Arena of forward invocations waiting for their backward call.
#[derive(Default)]
pub struct Invocations {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Invocations {
    /// Stores the inputs of a call that produced `outputs` values.
    pub(crate) fn record(&mut self, inputs: Vec<NdArray>, outputs: usize) -> RecordId {
        let record = Record {
            inputs,
            delivered: vec![false; outputs],
            pending: outputs,
        };
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot];
            entry.record = Some(record);
            return RecordId {
                slot,
                generation: entry.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        RecordId {
            slot: self.slots.len() - 1,
            generation: 0,
        }
    }

    fn get(&self, id: RecordId) -> Option<&Record> {
        self.slots
            .get(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.record.as_ref())
    }

    /// Inputs of a live record whose `output` has not been delivered yet.
    pub(crate) fn inputs(&self, id: RecordId, output: usize) -> Option<Vec<NdArray>> {
        self.get(id)
            .filter(|r| r.delivered.get(output) == Some(&false))
            .map(|r| r.inputs.clone())
    }

    /// Marks `output` delivered. Returns the inputs once every output has been.
    pub(crate) fn settle(&mut self, id: RecordId, output: usize) -> Option<Vec<NdArray>> {
        let slot = self
            .slots
            .get_mut(id.slot)
            .filter(|s| s.generation == id.generation)?;
        let record = slot.record.as_mut()?;
        *record.delivered.get_mut(output)? = true;
        record.pending -= 1;
        if record.pending > 0 {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation += 1;
        self.free.push(id.slot);
        Some(record.inputs)
    }

    /// Drops every record, returning their inputs.
    pub(crate) fn clear(&mut self) -> Vec<NdArray> {
        let mut inputs = Vec::new();
        self.free.clear();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(record) = slot.record.take() {
                slot.generation += 1;
                inputs.extend(record.inputs);
            }
            self.free.push(i);
        }
        inputs
    }

    /// Number of records still waiting for backward.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_some()).count()
    }

    /// Whether no record is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State every operation carries.
pub struct FunctionCore {
    /// Instance name, used in errors and logs.
    pub name: String,
    /// Port names read by a [`FunctionDictionary`](crate::FunctionDictionary).
    pub input_names: Vec<String>,
    /// Port names written by a [`FunctionDictionary`](crate::FunctionDictionary).
    pub output_names: Vec<String>,
    /// Pending forward invocations.
    pub invocations: Invocations,
    /// Update rule for [`Function::parameters`].
    pub optimizer: Option<Box<dyn Optimizer>>,
}

impl FunctionCore {
    /// Core with no ports and no optimizer.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_names: Vec::new(),
            output_names: Vec::new(),
            invocations: Invocations::default(),
            optimizer: None,
        }
    }
}

impl fmt::Debug for FunctionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCore")
            .field("name", &self.name)
            .field("input_names", &self.input_names)
            .field("output_names", &self.output_names)
            .field("pending", &self.invocations.len())
            .field("optimizer", &self.optimizer.as_ref().map(|o| o.name()))
            .finish()
    }
}

/// A differentiable operation.
///
/// `forward` and `backward` are the math only; call operations through
/// [`FunctionRef::forward`] so the result is recorded for backward.
pub trait Function {
    /// Shared state.
    fn core(&self) -> &FunctionCore;
    /// Shared state, mutably.
    fn core_mut(&mut self) -> &mut FunctionCore;

    /// Stable tag used by model files.
    fn kind(&self) -> &'static str;

    /// Input/output cardinality.
    fn arity(&self) -> Arity;

    /// Computes fresh outputs from `xs`.
    ///
    /// # Errors
    ///
    /// Shape errors for incompatible inputs, device errors for kernel
    /// failures.
    fn forward(&mut self, xs: &[NdArray]) -> Result<Vec<NdArray>>;

    /// Accumulates the gradient of output `output` (held in `y.grad`) into the
    /// gradients of `xs` and of any parameters. Must add, never overwrite.
    ///
    /// # Errors
    ///
    /// Shape errors if buffers disagree.
    fn backward(&mut self, output: usize, y: &NdArray, xs: &[NdArray]) -> Result<()>;

    /// Learnable tensors owned by this operation.
    fn parameters(&self) -> Vec<NdArray> {
        Vec::new()
    }

    /// Integer attributes needed to rebuild this operation from a model file.
    fn attributes(&self) -> Vec<i64> {
        Vec::new()
    }

    /// `Some` if this is a plain elementwise activation that a [`Fusible`]
    /// predecessor can absorb.
    fn activation(&self) -> Option<ActivationKind> {
        None
    }

    /// Fusion capability.
    fn as_fusible(&self) -> Option<&dyn Fusible> {
        None
    }

    /// Fusion capability, mutably.
    fn as_fusible_mut(&mut self) -> Option<&mut dyn Fusible> {
        None
    }

    /// Device capability.
    fn as_device_affine(&self) -> Option<&dyn DeviceAffine> {
        None
    }

    /// Device capability, mutably.
    fn as_device_affine_mut(&mut self) -> Option<&mut dyn DeviceAffine> {
        None
    }
}

/// Armed device program of a [`DeviceAffine`] operation.
#[derive(Default)]
pub struct DeviceState {
    armed: Option<(KernelManager, Program)>,
}

impl DeviceState {
    /// Whether forward should dispatch to the device.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Manager and compiled program, if armed.
    #[must_use]
    pub fn program(&self) -> Option<(&KernelManager, &Program)> {
        self.armed.as_ref().map(|(m, p)| (m, p))
    }

    /// Manager the program was compiled with.
    #[must_use]
    pub fn manager(&self) -> Option<&KernelManager> {
        self.armed.as_ref().map(|(m, _)| m)
    }

    pub(crate) fn arm(&mut self, manager: KernelManager, program: Program) {
        self.armed = Some((manager, program));
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = None;
    }
}

/// Operations that can run forward as a device kernel.
///
/// Backward always runs on the CPU.
pub trait DeviceAffine {
    /// Device state storage.
    fn device_state(&self) -> &DeviceState;
    /// Device state storage, mutably.
    fn device_state_mut(&mut self) -> &mut DeviceState;

    /// Program label, also the cache key prefix.
    fn kernel_label(&self) -> String;

    /// Full kernel source for this operation's current configuration.
    ///
    /// # Errors
    ///
    /// [`DeviceError::SourceNotFound`](crate::DeviceError::SourceNotFound) if
    /// the manager's provider lacks a template.
    fn kernel_source(&self, manager: &KernelManager) -> Result<String>;

    /// Whether forward currently dispatches to the device.
    fn device_enabled(&self) -> bool {
        self.device_state().is_armed()
    }

    /// Switches device execution on or off.
    ///
    /// Returns `false` when enabling failed (uninitialized manager, missing
    /// template, compile error); the operation then keeps running on the CPU.
    /// Disabling always succeeds.
    fn set_device_enable(&mut self, enable: bool, manager: &KernelManager) -> bool {
        if !enable {
            self.device_state_mut().disarm();
            return true;
        }
        if !manager.is_enabled() {
            debug!(kernel = %self.kernel_label(), "kernel manager disabled, staying on cpu");
            self.device_state_mut().disarm();
            return false;
        }
        match self.build_program(manager) {
            Ok(program) => {
                self.device_state_mut().arm(manager.clone(), program);
                true
            }
            Err(e) => {
                warn!(kernel = %self.kernel_label(), error = %e, "device enable failed, using cpu");
                self.device_state_mut().disarm();
                false
            }
        }
    }

    /// Recompiles the program against the manager it was armed with.
    ///
    /// Called after configuration changes such as fusion. A no-op when the
    /// operation is not armed.
    ///
    /// # Errors
    ///
    /// Propagates template and compile errors; the operation is disarmed.
    fn compile_kernel(&mut self) -> Result<()> {
        let Some(manager) = self.device_state().manager().cloned() else {
            return Ok(());
        };
        match self.build_program(&manager) {
            Ok(program) => {
                self.device_state_mut().arm(manager, program);
                Ok(())
            }
            Err(e) => {
                self.device_state_mut().disarm();
                Err(e)
            }
        }
    }

    #[doc(hidden)]
    fn build_program(&self, manager: &KernelManager) -> Result<Program> {
        let source = self.kernel_source(manager)?;
        Ok(manager.create_program(&self.kernel_label(), &source)?)
    }
}

/// Operations that can absorb a following activation.
pub trait Fusible {
    /// Activation already absorbed, if any.
    fn fused_activation(&self) -> Option<ActivationKind>;

    /// Absorbs `activation`. Returns `false` if one is already fused.
    fn fuse(&mut self, activation: ActivationKind) -> bool;
}

/// Producer link stored on every output tensor.
#[derive(Clone)]
pub(crate) struct Producer {
    pub(crate) function: FunctionRef,
    pub(crate) record: RecordId,
    pub(crate) output: usize,
}

/// Shared handle to an operation.
#[derive(Clone)]
pub struct FunctionRef(Rc<RefCell<dyn Function>>);

impl FunctionRef {
    /// Wraps an operation.
    pub fn new<F: Function + 'static>(function: F) -> Self {
        let cell: Rc<RefCell<dyn Function>> = Rc::new(RefCell::new(function));
        Self(cell)
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> String {
        self.0.borrow().core().name.clone()
    }

    /// Borrows the operation.
    #[must_use]
    pub fn borrow(&self) -> Ref<'_, dyn Function> {
        self.0.borrow()
    }

    /// Mutably borrows the operation.
    #[must_use]
    pub fn borrow_mut(&self) -> RefMut<'_, dyn Function> {
        self.0.borrow_mut()
    }

    /// Whether both handles point at the same operation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Runs the operation and records the call for backward.
    ///
    /// Every input gains one pending consumer and every output is linked
    /// back to this invocation.
    ///
    /// # Errors
    ///
    /// Arity mismatches and anything the operation's forward raises. Nothing
    /// is recorded on error.
    pub fn forward(&self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        let (ys, record) = {
            let mut f = self.0.borrow_mut();
            f.arity().check(&f.core().name, xs.len())?;
            let ys = f.forward(xs)?;
            let record = f.core_mut().invocations.record(xs.to_vec(), ys.len());
            (ys, record)
        };
        for x in xs {
            x.retain();
        }
        for (output, y) in ys.iter().enumerate() {
            y.set_parent(Producer {
                function: self.clone(),
                record,
                output,
            });
        }
        Ok(ys)
    }

    /// Runs the operation without recording anything.
    ///
    /// Inputs keep their consumer counts and outputs have no producer, so
    /// nothing here can be propagated through and nothing blocks fusion.
    ///
    /// # Errors
    ///
    /// Arity mismatches and anything the operation's forward raises.
    pub fn predict(&self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        let mut f = self.0.borrow_mut();
        f.arity().check(&f.core().name, xs.len())?;
        f.forward(xs)
    }

    /// Runs backward for one output of a recorded call.
    ///
    /// Returns the recorded inputs once every output of that call has been
    /// delivered, after crediting one training pass to each parameter.
    pub(crate) fn backward_record(
        &self,
        record: RecordId,
        output: usize,
        y: &NdArray,
    ) -> Result<Option<Vec<NdArray>>> {
        let mut f = self.0.borrow_mut();
        let xs = f
            .core()
            .invocations
            .inputs(record, output)
            .ok_or_else(|| GraphError::MissingRecord {
                function: f.core().name.clone(),
            })?;
        f.backward(output, y, &xs)?;
        let settled = f.core_mut().invocations.settle(record, output);
        if settled.is_some() {
            for p in f.parameters() {
                p.bump_train_count();
            }
        }
        Ok(settled)
    }

    /// Applies the optimizer to accumulated parameter gradients.
    ///
    /// Skipped entirely when no optimizer is set or no backward pass touched
    /// the parameters. Otherwise gradients are averaged over
    /// `train_count`, stepped, and cleared.
    ///
    /// # Errors
    ///
    /// Propagates optimizer errors.
    pub fn update(&self) -> Result<()> {
        let mut f = self.0.borrow_mut();
        let params = f.parameters();
        if params.iter().all(|p| p.train_count() == 0) {
            return Ok(());
        }
        let name = f.core().name.clone();
        let Some(optimizer) = f.core_mut().optimizer.as_mut() else {
            return Ok(());
        };
        for p in &params {
            p.average_grad();
        }
        optimizer.step(&params).map_err(|e| {
            warn!(function = %name, error = %e, "optimizer step failed");
            e
        })?;
        for p in &params {
            p.clear_grad();
        }
        Ok(())
    }

    /// Drops every pending invocation record and the consumer counts they
    /// hold. Optimizer state is kept.
    pub fn reset_state(&self) {
        let inputs = self.0.borrow_mut().core_mut().invocations.clear();
        for x in inputs {
            x.release();
        }
    }

    /// Installs an update rule.
    pub fn set_optimizer(&self, optimizer: Box<dyn Optimizer>) {
        self.0.borrow_mut().core_mut().optimizer = Some(optimizer);
    }

    /// Toggles device execution. Operations without the capability accept
    /// `false` and refuse `true`.
    pub fn set_device_enable(&self, enable: bool, manager: &KernelManager) -> bool {
        match self.0.borrow_mut().as_device_affine_mut() {
            Some(device) => device.set_device_enable(enable, manager),
            None => !enable,
        }
    }

    /// Whether forward currently dispatches to a device.
    #[must_use]
    pub fn device_enabled(&self) -> bool {
        self.0
            .borrow()
            .as_device_affine()
            .is_some_and(DeviceAffine::device_enabled)
    }

    /// Pending forward invocations.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.0.borrow().core().invocations.len()
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(inner) => f
                .debug_struct("FunctionRef")
                .field("kind", &inner.kind())
                .field("core", inner.core())
                .finish(),
            Err(_) => f.write_str("FunctionRef(<borrowed>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(v: f32) -> NdArray {
        NdArray::from_vec(&[1], vec![v as crate::Real]).unwrap()
    }

    #[test]
    fn arity_checks() {
        assert!(Arity::Single.check("f", 1).is_ok());
        assert!(Arity::Single.check("f", 2).is_err());
        assert!(Arity::Dual.check("f", 2).is_ok());
        assert!(Arity::Multi.check("f", 0).is_err());
        assert!(Arity::Multi.check("f", 5).is_ok());
        assert_eq!(
            Arity::Dual.check("add", 3),
            Err(ShapeError::Arity {
                function: "add".into(),
                expected: "2".into(),
                actual: 3
            })
        );
    }

    #[test]
    fn stale_handles_do_not_alias() {
        let mut arena = Invocations::default();
        let a = arena.record(vec![leaf(1.0)], 1);
        assert!(arena.settle(a, 0).is_some());
        let b = arena.record(vec![leaf(2.0)], 1);
        assert_eq!(arena.len(), 1);
        assert!(arena.inputs(a, 0).is_none());
        assert_eq!(arena.inputs(b, 0).unwrap()[0].to_vec(), vec![2.0]);
    }

    #[test]
    fn multi_output_record_settles_once_all_delivered() {
        let mut arena = Invocations::default();
        let id = arena.record(vec![leaf(1.0)], 2);
        assert!(arena.settle(id, 1).is_none());
        assert!(arena.inputs(id, 1).is_none());
        assert!(arena.inputs(id, 0).is_some());
        assert!(arena.settle(id, 0).is_some());
        assert!(arena.is_empty());
    }

    #[test]
    fn clear_invalidates_everything() {
        let mut arena = Invocations::default();
        let a = arena.record(vec![leaf(1.0)], 1);
        let b = arena.record(vec![leaf(2.0), leaf(3.0)], 1);
        assert_eq!(arena.clear().len(), 3);
        assert!(arena.inputs(a, 0).is_none());
        assert!(arena.inputs(b, 0).is_none());
        assert!(arena.is_empty());
    }
}
