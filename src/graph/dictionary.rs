use super::{fuse_pair, set_device_enable_all};
use crate::backprop;
use crate::device::KernelManager;
use crate::error::{Error, GraphError, Result, ShapeError};
use crate::function::{Function, FunctionRef};
use crate::optim::OptimizerFactory;
use crate::tensors::NdArray;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// A run of operations where each one reads the previous one's output.
#[derive(Debug)]
struct Chain {
    functions: Vec<FunctionRef>,
    /// Port the chain starts from.
    origin: String,
    /// Chain that wrote `origin`, if it was not a graph input.
    ancestor: Option<usize>,
}

impl Chain {
    /// Port written by the last member, or the origin while empty.
    fn tail_port(&self) -> Option<String> {
        match self.functions.last() {
            Some(f) => match f.borrow().core().output_names.as_slice() {
                [single] => Some(single.clone()),
                _ => None,
            },
            None => Some(self.origin.clone()),
        }
    }
}

/// Operations wired together by named ports.
///
/// Each operation declares the ports it reads and writes when added. Adding
/// extends the chain that wrote the operation's first input, unless that port
/// already has a consumer, in which case a new chain branches off it. An
/// operation with several outputs ends its chain and opens a fresh one per
/// output port, all sharing it as their ancestor.
///
/// Graph outputs are the ports that are written but never read, in the
/// order they were declared.
#[derive(Debug)]
pub struct FunctionDictionary {
    name: String,
    inputs: Vec<String>,
    functions: Vec<FunctionRef>,
    chains: Vec<Chain>,
    writers: HashMap<String, usize>,
    produced: Vec<String>,
    consumers: HashMap<String, usize>,
    splits: Vec<String>,
}

impl FunctionDictionary {
    /// Empty graph reading the given input ports.
    pub fn new(name: impl Into<String>, inputs: &[&str]) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.iter().map(ToString::to_string).collect(),
            functions: Vec::new(),
            chains: Vec::new(),
            writers: HashMap::new(),
            produced: Vec::new(),
            consumers: HashMap::new(),
            splits: Vec::new(),
        }
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared input ports.
    #[must_use]
    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    /// Ports written but never read, in declaration order.
    #[must_use]
    pub fn output_names(&self) -> Vec<String> {
        self.produced
            .iter()
            .filter(|p| !self.consumers.contains_key(*p))
            .cloned()
            .collect()
    }

    /// Members in registration order.
    #[must_use]
    pub fn functions(&self) -> &[FunctionRef] {
        &self.functions
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Number of chains, including empty ones opened by multi-output members.
    #[must_use]
    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    /// Ports read by more than one member.
    #[must_use]
    pub fn split_ports(&self) -> &[String] {
        &self.splits
    }

    /// Ancestor chain of each chain.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Option<usize>> {
        self.chains.iter().map(|c| c.ancestor).collect()
    }

    /// Adds an operation reading `inputs` and writing `outputs`.
    ///
    /// # Errors
    ///
    /// - [`ShapeError::Arity`] if the input port count does not fit the
    ///   operation
    /// - [`GraphError::UnknownPort`] if an input is neither a graph input nor
    ///   written by an earlier member
    /// - [`GraphError::DuplicatePort`] if an output is already taken or
    ///   repeated
    pub fn add<F: Function + 'static>(&mut self, function: F, inputs: &[&str], outputs: &[&str]) -> Result<FunctionRef> {
        let f = FunctionRef::new(function);
        self.add_ref(f.clone(), inputs, outputs)?;
        Ok(f)
    }

    /// Like [`add`](Self::add) for an existing handle.
    ///
    /// Port names are stored on the operation itself, so a handle can be
    /// registered only once.
    ///
    /// # Errors
    ///
    /// See [`add`](Self::add); re-registering a handle is a
    /// [`GraphError::DuplicatePort`] on its first output.
    pub fn add_ref(&mut self, function: FunctionRef, inputs: &[&str], outputs: &[&str]) -> Result<()> {
        let name = function.name();
        if self.functions.iter().any(|f| f.ptr_eq(&function)) {
            let port = function.borrow().core().output_names.first().cloned().unwrap_or_default();
            return Err(GraphError::DuplicatePort { function: name, port }.into());
        }
        function.borrow().arity().check(&name, inputs.len())?;
        for port in inputs {
            if !self.is_known(port) {
                return Err(GraphError::UnknownPort {
                    function: name,
                    port: (*port).to_string(),
                }
                .into());
            }
        }
        let mut seen = HashSet::new();
        if outputs.is_empty() {
            return Err(ShapeError::Arity {
                function: name,
                expected: "at least 1 output port".to_string(),
                actual: 0,
            }
            .into());
        }
        for port in outputs {
            if self.is_known(port) || !seen.insert(*port) {
                return Err(GraphError::DuplicatePort {
                    function: name,
                    port: (*port).to_string(),
                }
                .into());
            }
        }

        {
            let mut f = function.borrow_mut();
            let core = f.core_mut();
            core.input_names = inputs.iter().map(ToString::to_string).collect();
            core.output_names = outputs.iter().map(ToString::to_string).collect();
        }

        let first = inputs[0];
        let chain = self.place(first, &name);
        self.chains[chain].functions.push(function.clone());
        for port in inputs {
            *self.consumers.entry((*port).to_string()).or_default() += 1;
        }

        if let [single] = outputs {
            self.writers.insert((*single).to_string(), chain);
        } else {
            for port in outputs {
                self.chains.push(Chain {
                    functions: Vec::new(),
                    origin: (*port).to_string(),
                    ancestor: Some(chain),
                });
                self.writers.insert((*port).to_string(), self.chains.len() - 1);
            }
        }
        self.produced.extend(outputs.iter().map(ToString::to_string));
        self.functions.push(function);
        Ok(())
    }

    fn is_known(&self, port: &str) -> bool {
        self.inputs.iter().any(|p| p == port) || self.writers.contains_key(port)
    }

    /// Chain a member reading `port` first should join.
    fn place(&mut self, port: &str, function: &str) -> usize {
        let consumed = self.consumers.get(port).copied().unwrap_or(0) > 0;
        let writer = self.writers.get(port).copied();

        if let Some(c) = writer {
            if !consumed && self.chains[c].tail_port().as_deref() == Some(port) {
                trace!(function, chain = c, "extending chain");
                return c;
            }
        }
        if consumed && !self.splits.iter().any(|s| s == port) {
            debug!(container = %self.name, port, "fan-out");
            self.splits.push(port.to_string());
        }
        self.chains.push(Chain {
            functions: Vec::new(),
            origin: port.to_string(),
            ancestor: writer,
        });
        self.chains.len() - 1
    }

    /// Runs every member with inputs bound positionally to
    /// [`input_names`](Self::input_names), returning values for
    /// [`output_names`](Self::output_names).
    ///
    /// # Errors
    ///
    /// [`ShapeError::Arity`] if `xs` does not match the declared inputs, plus
    /// everything [`forward_named`](Self::forward_named) raises.
    pub fn forward(&self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        let feeds = self.positional(xs)?;
        let ports = self.forward_named(feeds)?;
        self.outputs_of(ports)
    }

    /// Like [`forward`](Self::forward) but records nothing; see
    /// [`FunctionRef::predict`].
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward).
    pub fn predict(&self, xs: &[NdArray]) -> Result<Vec<NdArray>> {
        let feeds = self.positional(xs)?;
        let ports = self.predict_named(feeds)?;
        self.outputs_of(ports)
    }

    /// Runs every member, sweeping chains in dependency order, and returns
    /// the value of every port.
    ///
    /// # Errors
    ///
    /// - [`GraphError::EmptyContainer`] with no members
    /// - [`GraphError::UnresolvedPort`] when a member's input never becomes
    ///   available (missing feed)
    /// - any member forward error
    pub fn forward_named(&self, feeds: HashMap<String, NdArray>) -> Result<HashMap<String, NdArray>> {
        self.sweep(feeds, FunctionRef::forward)
    }

    /// Inference form of [`forward_named`](Self::forward_named).
    ///
    /// # Errors
    ///
    /// Same as [`forward_named`](Self::forward_named).
    pub fn predict_named(&self, feeds: HashMap<String, NdArray>) -> Result<HashMap<String, NdArray>> {
        self.sweep(feeds, FunctionRef::predict)
    }

    fn positional(&self, xs: &[NdArray]) -> Result<HashMap<String, NdArray>> {
        if xs.len() != self.inputs.len() {
            return Err(ShapeError::Arity {
                function: self.name.clone(),
                expected: self.inputs.len().to_string(),
                actual: xs.len(),
            }
            .into());
        }
        Ok(self.inputs.iter().cloned().zip(xs.iter().cloned()).collect())
    }

    fn outputs_of(&self, mut ports: HashMap<String, NdArray>) -> Result<Vec<NdArray>> {
        self.output_names()
            .into_iter()
            .map(|p| {
                ports.remove(&p).ok_or_else(|| {
                    Error::from(GraphError::UnresolvedPort {
                        container: self.name.clone(),
                        port: p,
                    })
                })
            })
            .collect()
    }

    fn sweep(
        &self,
        feeds: HashMap<String, NdArray>,
        run: fn(&FunctionRef, &[NdArray]) -> Result<Vec<NdArray>>,
    ) -> Result<HashMap<String, NdArray>> {
        if self.functions.is_empty() {
            return Err(GraphError::EmptyContainer(self.name.clone()).into());
        }
        let mut scratch = feeds;
        let mut cursors = vec![0usize; self.chains.len()];

        loop {
            let mut progressed = false;
            for (chain, cursor) in self.chains.iter().zip(cursors.iter_mut()) {
                while let Some(f) = chain.functions.get(*cursor) {
                    let (inputs, outputs) = {
                        let inner = f.borrow();
                        (inner.core().input_names.clone(), inner.core().output_names.clone())
                    };
                    let Some(xs) = inputs.iter().map(|p| scratch.get(p).cloned()).collect::<Option<Vec<_>>>() else {
                        break;
                    };
                    let ys = run(f, &xs)?;
                    if ys.len() != outputs.len() {
                        return Err(ShapeError::Arity {
                            function: f.name(),
                            expected: format!("{} output port(s)", outputs.len()),
                            actual: ys.len(),
                        }
                        .into());
                    }
                    scratch.extend(outputs.into_iter().zip(ys));
                    *cursor += 1;
                    progressed = true;
                }
            }

            let pending = self
                .chains
                .iter()
                .zip(&cursors)
                .find_map(|(chain, &cursor)| chain.functions.get(cursor));
            let Some(blocked) = pending else {
                return Ok(scratch);
            };
            if !progressed {
                let missing = blocked
                    .borrow()
                    .core()
                    .input_names
                    .iter()
                    .find(|p| !scratch.contains_key(*p))
                    .cloned()
                    .unwrap_or_default();
                return Err(GraphError::UnresolvedPort {
                    container: self.name.clone(),
                    port: missing,
                }
                .into());
            }
        }
    }

    /// Propagates the gradients already stored on `ys`.
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

    /// Runs every member's update in registration order.
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

    /// Toggles device execution on every capable member; `true` only if all
    /// accepted.
    pub fn set_device_enable(&self, enable: bool, manager: &KernelManager) -> bool {
        set_device_enable_all(&self.functions, enable, manager)
    }

    /// Learnable tensors of every member, in registration order.
    #[must_use]
    pub fn parameters(&self) -> Vec<NdArray> {
        self.functions.iter().flat_map(|f| f.borrow().parameters()).collect()
    }

    /// Single pass over every chain, fusing a fusible member with the
    /// activation after it when the port between them has no other reader.
    /// Returns the number of fused pairs.
    pub fn compress(&mut self) -> usize {
        let mut fused = 0;
        for c in 0..self.chains.len() {
            let mut i = 0;
            while i + 1 < self.chains[c].functions.len() {
                let (head, next) = (&self.chains[c].functions[i], &self.chains[c].functions[i + 1]);
                let link = match head.borrow().core().output_names.as_slice() {
                    [single] => Some(single.clone()),
                    _ => None,
                };
                let exclusive = link
                    .as_ref()
                    .is_some_and(|p| self.consumers.get(p) == Some(&1));
                if exclusive && fuse_pair(head, next) {
                    let removed = self.chains[c].functions.remove(i + 1);
                    self.functions.retain(|f| !f.ptr_eq(&removed));
                    if let Some(port) = link {
                        self.consumers.remove(&port);
                        self.writers.remove(&port);
                        self.produced.retain(|p| *p != port);
                    }
                    for port in &removed.borrow().core().output_names {
                        self.writers.insert(port.clone(), c);
                    }
                    debug!(container = %self.name, absorbed = %removed.name(), "fused");
                    fused += 1;
                }
                i += 1;
            }
        }
        fused
    }
}
