//! Saving and loading whole containers.
//!
//! # `.bgrd` format
//!
//! All integers are little-endian.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ "BGRD"[4]  u16 version  u8 container (0 stack, 1 dictionary) │
//! │ str name   [dictionary: u32 n, str × n input ports]          │
//! │ u32 function count                                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ per function:                                               │
//! │   str kind  str name                                        │
//! │   u32 n, str × n input ports   u32 n, str × n output ports  │
//! │   u8 device enabled                                         │
//! │   u32 n, i64 × n attributes                                 │
//! │   u32 n parameters, each:                                   │
//! │     u32 rank, u64 × rank shape, u64 batch count,            │
//! │     f64 × (prod(shape) · batch) data                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ u32 CRC-32 of every preceding byte                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! `str` is a `u32` byte length followed by UTF-8. Data is always stored as
//! `f64` so files move between `f32` and `f64` builds.
//!
//! Operations are rebuilt through a [`FunctionRegistry`] keyed by
//! [`Function::kind`](crate::Function::kind). Invocation records and
//! optimizer state are not stored; loaded operations start clean, and the
//! ones saved with device execution enabled are re-armed against the
//! [`KernelManager`] passed to the loader.
//!
//! # Example
//!
//! ```rust,no_run
//! use briny_grad::functions::{Activation, ActivationKind, Linear};
//! use briny_grad::modelio::{FunctionRegistry, load_stack, save_stack};
//! use briny_grad::{FunctionStack, KernelManager};
//!
//! # fn main() -> briny_grad::Result<()> {
//! let mut net = FunctionStack::new("mlp");
//! net.push(Linear::new("fc", 4, 2)?);
//! net.push(Activation::new("act", ActivationKind::Sigmoid));
//! save_stack("mlp.bgrd", &net)?;
//!
//! let restored = load_stack("mlp.bgrd", &FunctionRegistry::with_builtins(), &KernelManager::disabled())?;
//! assert_eq!(restored.len(), 2);
//! # Ok(())
//! # }
//! ```

use crate::Real;
use crate::device::KernelManager;
use crate::error::{ModelError, Result};
use crate::function::{Function, FunctionRef};
use crate::functions::{Activation, Add, AddN, Broadcast, Concat, Linear, Mul, SplitAxis, SumAxes};
use crate::graph::{FunctionDictionary, FunctionStack};
use crate::tensors::{NdArray, checked_total};
use crc32fast::Hasher;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"BGRD";
const VERSION: u16 = 1;
const TAG_STACK: u8 = 0;
const TAG_DICTIONARY: u8 = 1;

/// Everything stored about one operation.
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    /// Kind tag used to pick a constructor.
    pub kind: String,
    /// Operation name.
    pub name: String,
    /// Ports read inside a dictionary; empty in a stack.
    pub input_names: Vec<String>,
    /// Ports written inside a dictionary; empty in a stack.
    pub output_names: Vec<String>,
    /// Whether device execution was enabled when saved.
    pub device: bool,
    /// Integer attributes from [`Function::attributes`].
    pub attributes: Vec<i64>,
    /// Learnable tensors from [`Function::parameters`].
    pub parameters: Vec<NdArray>,
}

impl FunctionDescriptor {
    fn of(f: &FunctionRef) -> Self {
        let device = f.device_enabled();
        let inner = f.borrow();
        let core = inner.core();
        Self {
            kind: inner.kind().to_string(),
            name: core.name.clone(),
            input_names: core.input_names.clone(),
            output_names: core.output_names.clone(),
            device,
            attributes: inner.attributes(),
            parameters: inner.parameters(),
        }
    }
}

/// Builds an operation from its descriptor.
pub type Constructor = fn(&FunctionDescriptor) -> core::result::Result<FunctionRef, ModelError>;

/// Constructors by kind tag.
pub struct FunctionRegistry {
    constructors: HashMap<String, Constructor>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl core::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut kinds: Vec<&String> = self.constructors.keys().collect();
        kinds.sort();
        f.debug_struct("FunctionRegistry").field("kinds", &kinds).finish()
    }
}

fn plain<F: Function + 'static>(build: impl FnOnce(String) -> F, d: &FunctionDescriptor) -> core::result::Result<FunctionRef, ModelError> {
    if !d.attributes.is_empty() || !d.parameters.is_empty() {
        return Err(ModelError::InvalidDescriptor {
            kind: d.kind.clone(),
            reason: "takes no attributes or parameters".into(),
        });
    }
    Ok(FunctionRef::new(build(d.name.clone())))
}

impl FunctionRegistry {
    /// Registry with no constructors.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry knowing every operation in [`functions`](crate::functions).
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register("linear", |d| {
            Ok(FunctionRef::new(Linear::from_parts(&d.name, &d.attributes, d.parameters.clone())?))
        });
        r.register("activation", |d| {
            Ok(FunctionRef::new(Activation::from_attributes(&d.name, &d.attributes)?))
        });
        r.register("add", |d| plain(Add::new, d));
        r.register("mul", |d| plain(Mul::new, d));
        r.register("add_n", |d| plain(AddN::new, d));
        r.register("sum", |d| Ok(FunctionRef::new(SumAxes::from_attributes(&d.name, &d.attributes)?)));
        r.register("broadcast", |d| {
            Ok(FunctionRef::new(Broadcast::from_attributes(&d.name, &d.attributes)?))
        });
        r.register("split", |d| {
            Ok(FunctionRef::new(SplitAxis::from_attributes(&d.name, &d.attributes)?))
        });
        r.register("concat", |d| Ok(FunctionRef::new(Concat::from_attributes(&d.name, &d.attributes)?)));
        r
    }

    /// Adds or replaces the constructor for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, constructor: Constructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    /// Whether `kind` has a constructor.
    #[must_use]
    pub fn knows(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Rebuilds one operation, re-arming device execution if it was saved
    /// enabled.
    ///
    /// # Errors
    ///
    /// [`ModelError::UnknownKind`] or the constructor's own error.
    pub fn build(&self, d: &FunctionDescriptor, manager: &KernelManager) -> core::result::Result<FunctionRef, ModelError> {
        let constructor = self
            .constructors
            .get(&d.kind)
            .ok_or_else(|| ModelError::UnknownKind(d.kind.clone()))?;
        let f = constructor(d)?;
        if d.device && !f.set_device_enable(true, manager) {
            warn!(function = %d.name, "saved with device execution, continuing on the cpu");
        }
        Ok(f)
    }
}

type Encoded<T = ()> = core::result::Result<T, ModelError>;

#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, what: &'static str, v: usize) -> Encoded {
        let v = u32::try_from(v).map_err(|_| ModelError::TooLarge { what, value: v })?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    fn u64(&mut self, v: usize) {
        self.buf.extend_from_slice(&(v as u64).to_le_bytes());
    }

    fn str(&mut self, s: &str) -> Encoded {
        self.u32("string length", s.len())?;
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn strs(&mut self, items: &[String]) -> Encoded {
        self.u32("port count", items.len())?;
        for s in items {
            self.str(s)?;
        }
        Ok(())
    }

    fn tensor(&mut self, t: &NdArray) -> Encoded {
        let shape = t.shape();
        self.u32("tensor rank", shape.len())?;
        for &d in &shape {
            self.u64(d);
        }
        self.u64(t.batch_count());
        for &v in t.data().iter() {
            self.buf.extend_from_slice(&f64::from(v).to_le_bytes());
        }
        Ok(())
    }

    fn function(&mut self, d: &FunctionDescriptor) -> Encoded {
        self.str(&d.kind)?;
        self.str(&d.name)?;
        self.strs(&d.input_names)?;
        self.strs(&d.output_names)?;
        self.u8(u8::from(d.device));
        self.u32("attribute count", d.attributes.len())?;
        for a in &d.attributes {
            self.buf.extend_from_slice(&a.to_le_bytes());
        }
        self.u32("parameter count", d.parameters.len())?;
        for p in &d.parameters {
            self.tensor(p)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        let mut hasher = Hasher::new();
        hasher.update(&self.buf);
        let crc = hasher.finalize();
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> core::result::Result<&'a [u8], ModelError> {
        let end = self.pos.checked_add(n).ok_or(ModelError::Truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or(ModelError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> core::result::Result<[u8; N], ModelError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> core::result::Result<u8, ModelError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> core::result::Result<usize, ModelError> {
        Ok(u32::from_le_bytes(self.array()?) as usize)
    }

    fn u64(&mut self) -> core::result::Result<usize, ModelError> {
        usize::try_from(u64::from_le_bytes(self.array()?)).map_err(|_| ModelError::Truncated)
    }

    fn str(&mut self) -> core::result::Result<String, ModelError> {
        let n = self.u32()?;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| ModelError::InvalidDescriptor {
            kind: "string".into(),
            reason: e.to_string(),
        })
    }

    fn strs(&mut self) -> core::result::Result<Vec<String>, ModelError> {
        let n = self.u32()?;
        (0..n).map(|_| self.str()).collect()
    }

    fn tensor(&mut self, kind: &str) -> core::result::Result<NdArray, ModelError> {
        let rank = self.u32()?;
        let shape = (0..rank).map(|_| self.u64()).collect::<core::result::Result<Vec<_>, _>>()?;
        let batch = self.u64()?;
        let invalid = |reason: String| ModelError::InvalidDescriptor {
            kind: kind.to_string(),
            reason,
        };
        let total = checked_total(&shape, batch).map_err(|e| invalid(e.to_string()))?;
        let bytes = self.take(total.checked_mul(8).ok_or(ModelError::Truncated)?)?;
        let data = bytes
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b) as Real
            })
            .collect();
        NdArray::from_batch(&shape, batch, data).map_err(|e| invalid(e.to_string()))
    }

    fn function(&mut self) -> core::result::Result<FunctionDescriptor, ModelError> {
        let kind = self.str()?;
        let name = self.str()?;
        let input_names = self.strs()?;
        let output_names = self.strs()?;
        let device = self.u8()? != 0;
        let n = self.u32()?;
        let attributes = (0..n)
            .map(|_| self.array().map(i64::from_le_bytes))
            .collect::<core::result::Result<Vec<_>, _>>()?;
        let n = self.u32()?;
        let parameters = (0..n).map(|_| self.tensor(&kind)).collect::<core::result::Result<Vec<_>, _>>()?;
        Ok(FunctionDescriptor {
            kind,
            name,
            input_names,
            output_names,
            device,
            attributes,
            parameters,
        })
    }
}

fn header(container: u8, name: &str) -> Encoded<Encoder> {
    let mut e = Encoder::default();
    e.buf.extend_from_slice(MAGIC);
    e.buf.extend_from_slice(&VERSION.to_le_bytes());
    e.u8(container);
    e.str(name)?;
    Ok(e)
}

/// Verifies magic, version and checksum; returns a decoder past the version.
fn open(bytes: &[u8]) -> core::result::Result<Decoder<'_>, ModelError> {
    if !bytes.starts_with(MAGIC) {
        return Err(ModelError::InvalidHeader);
    }
    let split = bytes.len().checked_sub(4).ok_or(ModelError::Truncated)?;
    let (payload, trailer) = bytes.split_at(split);
    let mut stored = [0u8; 4];
    stored.copy_from_slice(trailer);
    let stored = u32::from_le_bytes(stored);
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(ModelError::Checksum { stored, computed });
    }

    let mut d = Decoder {
        buf: payload,
        pos: MAGIC.len(),
    };
    if u16::from_le_bytes(d.array()?) != VERSION {
        return Err(ModelError::InvalidHeader);
    }
    Ok(d)
}

/// Serializes a stack.
///
/// # Errors
///
/// [`ModelError::TooLarge`] if a name, count or rank overflows its field.
pub fn encode_stack(stack: &FunctionStack) -> Result<Vec<u8>> {
    let mut e = header(TAG_STACK, stack.name())?;
    e.u32("function count", stack.len())?;
    for f in stack.functions() {
        e.function(&FunctionDescriptor::of(f))?;
    }
    Ok(e.finish())
}

/// Serializes a dictionary, members in registration order.
///
/// # Errors
///
/// [`ModelError::TooLarge`] if a name, count or rank overflows its field.
pub fn encode_dictionary(dict: &FunctionDictionary) -> Result<Vec<u8>> {
    let mut e = header(TAG_DICTIONARY, dict.name())?;
    e.strs(dict.input_names())?;
    e.u32("function count", dict.len())?;
    for f in dict.functions() {
        e.function(&FunctionDescriptor::of(f))?;
    }
    Ok(e.finish())
}

fn container(d: &mut Decoder<'_>, expected: u8) -> core::result::Result<String, ModelError> {
    if d.u8()? != expected {
        return Err(ModelError::InvalidHeader);
    }
    d.str()
}

/// Rebuilds a stack from [`encode_stack`] output.
///
/// # Errors
///
/// Any [`ModelError`] for malformed input.
pub fn decode_stack(bytes: &[u8], registry: &FunctionRegistry, manager: &KernelManager) -> Result<FunctionStack> {
    let mut d = open(bytes)?;
    let name = container(&mut d, TAG_STACK)?;
    let count = d.u32()?;
    let mut stack = FunctionStack::new(name);
    for _ in 0..count {
        let desc = d.function()?;
        stack.push_ref(registry.build(&desc, manager)?);
    }
    debug!(container = %stack.name(), functions = count, "loaded stack");
    Ok(stack)
}

/// Rebuilds a dictionary from [`encode_dictionary`] output.
///
/// # Errors
///
/// Any [`ModelError`] for malformed input, or a graph error if the stored
/// wiring is inconsistent.
pub fn decode_dictionary(bytes: &[u8], registry: &FunctionRegistry, manager: &KernelManager) -> Result<FunctionDictionary> {
    let mut d = open(bytes)?;
    let name = container(&mut d, TAG_DICTIONARY)?;
    let inputs = d.strs()?;
    let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();
    let count = d.u32()?;
    let mut dict = FunctionDictionary::new(name, &inputs);
    for _ in 0..count {
        let desc = d.function()?;
        let f = registry.build(&desc, manager)?;
        let ins: Vec<&str> = desc.input_names.iter().map(String::as_str).collect();
        let outs: Vec<&str> = desc.output_names.iter().map(String::as_str).collect();
        dict.add_ref(f, &ins, &outs)?;
    }
    debug!(container = %dict.name(), functions = count, "loaded dictionary");
    Ok(dict)
}

/// Writes a stack to `path`.
///
/// # Errors
///
/// [`ModelError::Io`] on write failure, or see [`encode_stack`].
pub fn save_stack(path: impl AsRef<Path>, stack: &FunctionStack) -> Result<()> {
    fs::write(path, encode_stack(stack)?).map_err(ModelError::from)?;
    Ok(())
}

/// Reads a stack from `path`.
///
/// # Errors
///
/// See [`decode_stack`], plus [`ModelError::Io`].
pub fn load_stack(path: impl AsRef<Path>, registry: &FunctionRegistry, manager: &KernelManager) -> Result<FunctionStack> {
    let bytes = fs::read(path).map_err(ModelError::from)?;
    decode_stack(&bytes, registry, manager)
}

/// Writes a dictionary to `path`.
///
/// # Errors
///
/// [`ModelError::Io`] on write failure, or see [`encode_dictionary`].
pub fn save_dictionary(path: impl AsRef<Path>, dict: &FunctionDictionary) -> Result<()> {
    fs::write(path, encode_dictionary(dict)?).map_err(ModelError::from)?;
    Ok(())
}

/// Reads a dictionary from `path`.
///
/// # Errors
///
/// See [`decode_dictionary`], plus [`ModelError::Io`].
pub fn load_dictionary(
    path: impl AsRef<Path>,
    registry: &FunctionRegistry,
    manager: &KernelManager,
) -> Result<FunctionDictionary> {
    let bytes = fs::read(path).map_err(ModelError::from)?;
    decode_dictionary(&bytes, registry, manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::functions::ActivationKind;

    fn net() -> FunctionStack {
        let mut s = FunctionStack::new("net");
        s.push(Linear::seeded("l1", 3, 2, 7).unwrap());
        s.push(Activation::new("a1", ActivationKind::Tanh));
        s.push(SplitAxis::new("split", vec![1], 0));
        s
    }

    #[test]
    fn stack_survives_encoding() {
        let s = net();
        let bytes = encode_stack(&s).unwrap();
        let back = decode_stack(&bytes, &FunctionRegistry::with_builtins(), &KernelManager::disabled()).unwrap();
        assert_eq!(back.name(), "net");
        assert_eq!(back.len(), 3);

        let x = NdArray::from_vec(&[3], vec![0.5, -1.0, 2.0]).unwrap();
        let a: Vec<Vec<Real>> = s.forward(&[x.clone()]).unwrap().iter().map(NdArray::to_vec).collect();
        let b: Vec<Vec<Real>> = back.forward(&[x]).unwrap().iter().map(NdArray::to_vec).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn corruption_fails_the_checksum() {
        let mut bytes = encode_stack(&net()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        let err = decode_stack(&bytes, &FunctionRegistry::with_builtins(), &KernelManager::disabled());
        assert!(matches!(err, Err(Error::Model(ModelError::Checksum { .. }))));
    }

    #[test]
    fn foreign_bytes_are_rejected() {
        let err = decode_stack(b"nope", &FunctionRegistry::with_builtins(), &KernelManager::disabled());
        assert!(matches!(err, Err(Error::Model(ModelError::InvalidHeader))));
        let err = decode_stack(b"BGR", &FunctionRegistry::with_builtins(), &KernelManager::disabled());
        assert!(matches!(err, Err(Error::Model(ModelError::InvalidHeader))));
    }

    #[test]
    fn unknown_kind_is_reported() {
        let bytes = encode_stack(&net()).unwrap();
        let err = decode_stack(&bytes, &FunctionRegistry::empty(), &KernelManager::disabled());
        assert!(matches!(err, Err(Error::Model(ModelError::UnknownKind(ref k))) if k == "linear"));
    }

    #[test]
    fn dictionary_is_not_a_stack() {
        let mut g = FunctionDictionary::new("g", &["x"]);
        g.add(Activation::new("a", ActivationKind::Relu), &["x"], &["y"]).unwrap();
        let bytes = encode_dictionary(&g).unwrap();
        let err = decode_stack(&bytes, &FunctionRegistry::with_builtins(), &KernelManager::disabled());
        assert!(matches!(err, Err(Error::Model(ModelError::InvalidHeader))));
        let back = decode_dictionary(&bytes, &FunctionRegistry::with_builtins(), &KernelManager::disabled()).unwrap();
        assert_eq!(back.input_names(), ["x"]);
        assert_eq!(back.output_names(), ["y"]);
    }

    #[test]
    fn batched_tensors_keep_every_instance() {
        let t = NdArray::from_batch(&[2], 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mut e = Encoder::default();
        e.tensor(&t).unwrap();
        e.u32("marker", 0xbeef).unwrap();

        let mut d = Decoder { buf: &e.buf, pos: 0 };
        let back = d.tensor("test").unwrap();
        assert_eq!(back.shape(), [2]);
        assert_eq!(back.batch_count(), 3);
        assert_eq!(back.to_vec(), t.to_vec());
        assert_eq!(d.u32().unwrap(), 0xbeef);
        assert_eq!(d.pos, e.buf.len());
    }

    #[test]
    fn crafted_shapes_do_not_overflow() {
        let mut e = Encoder::default();
        e.u32("rank", 2).unwrap();
        e.u64(1 << (usize::BITS / 2 + 4));
        e.u64(1 << (usize::BITS / 2 + 4));
        e.u64(1);
        let mut d = Decoder { buf: &e.buf, pos: 0 };
        assert!(matches!(d.tensor("test"), Err(ModelError::InvalidDescriptor { .. })));

        // valid shape, data missing
        let mut e = Encoder::default();
        e.u32("rank", 1).unwrap();
        e.u64(1 << 20);
        e.u64(4);
        let mut d = Decoder { buf: &e.buf, pos: 0 };
        assert!(matches!(d.tensor("test"), Err(ModelError::Truncated)));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_lengths_are_refused() {
        let mut e = Encoder::default();
        let value = u32::MAX as usize + 1;
        assert!(matches!(
            e.u32("string length", value),
            Err(ModelError::TooLarge { what: "string length", value: v }) if v == value
        ));
        assert!(e.buf.is_empty());
    }
}
