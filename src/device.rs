//! Device kernel management.
//!
//! A [`KernelManager`] is created once and handed explicitly to every
//! operation that should run on a device. It owns:
//!
//! - the device context (only with the `wgpu` feature)
//! - a [`KernelSourceProvider`] that supplies WGSL templates by name
//! - a cache of compiled [`Program`]s keyed by their full source text
//!
//! Sources are generated by [`KernelManager::program_source`], which fills
//! `{{KEY}}` placeholders in a template and prepends a precision header
//! declaring the `Real` scalar alias.
//!
//! A manager that was never initialized, or whose initialization failed, is
//! *disabled*: every request to arm a kernel is refused and operations stay
//! on their CPU path.
//!
//! # Example
//!
//! ```rust
//! use briny_grad::KernelManager;
//! use briny_grad::backend::DeviceOptions;
//!
//! let manager = KernelManager::initialize(DeviceOptions::from_env());
//! if !manager.is_enabled() {
//!     println!("running on cpu");
//! }
//! ```

use crate::Real;
use crate::backend::{DeviceOptions, Precision};
use crate::error::DeviceError;
use core::fmt;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

lazy_static::lazy_static! {
    static ref BUILTIN_SOURCES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("linear", include_str!("ops/shaders/linear.wgsl"));
        m.insert("activation", include_str!("ops/shaders/activation.wgsl"));
        m
    };
}

/// Supplies kernel templates by name.
pub trait KernelSourceProvider {
    /// Template text, or `None` if this provider has no such kernel.
    fn template(&self, name: &str) -> Option<Cow<'static, str>>;
}

/// Templates shipped with the crate: `linear` and `activation`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSources;

impl KernelSourceProvider for BuiltinSources {
    fn template(&self, name: &str) -> Option<Cow<'static, str>> {
        BUILTIN_SOURCES.get(name).map(|s| Cow::Borrowed(*s))
    }
}

/// Precision header prepended to every generated source.
///
/// WGSL has no `enable` directive for `f64`. naga accepts the type once the
/// device was requested with `SHADER_F64`, which the `wgpu` back-end does
/// for [`Precision::Double`] and refuses otherwise.
#[must_use]
pub fn precision_header(precision: Precision) -> String {
    format!("alias Real = {};\n\n", precision.wgsl_type())
}

/// Entry point name derived from a program label.
#[must_use]
pub fn entry_point(label: &str) -> String {
    let body: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("k_{body}")
}

/// A compiled kernel, ready to dispatch.
#[derive(Clone)]
pub struct Program {
    label: String,
    entry: String,
    #[cfg(feature = "wgpu")]
    kernel: Rc<crate::ops::wgpu::CompiledKernel>,
}

impl Program {
    /// Label it was compiled under.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Entry point name.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("label", &self.label)
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

struct ManagerState {
    options: DeviceOptions,
    #[cfg(feature = "wgpu")]
    context: Option<crate::ops::wgpu::GpuContext>,
    sources: Box<dyn KernelSourceProvider>,
    programs: RefCell<HashMap<String, Program>>,
}

/// Shared handle to the device context and compiled-program cache.
#[derive(Clone)]
pub struct KernelManager(Rc<ManagerState>);

impl Default for KernelManager {
    fn default() -> Self {
        Self::disabled()
    }
}

impl KernelManager {
    /// A manager with no device. Every enable request is refused.
    #[must_use]
    pub fn disabled() -> Self {
        Self::from_parts(DeviceOptions::default(), Box::new(BuiltinSources), None)
    }

    /// Opens a device matching `options`, or returns a disabled manager if
    /// none is available. Failures are logged.
    #[must_use]
    pub fn initialize(options: DeviceOptions) -> Self {
        Self::initialize_with_sources(options, Box::new(BuiltinSources))
    }

    /// Like [`initialize`](Self::initialize) with a custom template provider.
    #[must_use]
    pub fn initialize_with_sources(options: DeviceOptions, sources: Box<dyn KernelSourceProvider>) -> Self {
        match Self::try_initialize_with_sources(options, sources) {
            Ok(manager) => manager,
            Err((e, sources)) => {
                warn!(class = %options.class, error = %e, "no device available, kernels disabled");
                Self::from_parts(options, sources, None)
            }
        }
    }

    /// Opens a device matching `options`.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Unavailable`] without the `wgpu` feature, otherwise any
    /// adapter, precision or device request failure.
    pub fn try_initialize(options: DeviceOptions) -> Result<Self, DeviceError> {
        Self::try_initialize_with_sources(options, Box::new(BuiltinSources)).map_err(|(e, _)| e)
    }

    #[cfg(feature = "wgpu")]
    fn try_initialize_with_sources(
        options: DeviceOptions,
        sources: Box<dyn KernelSourceProvider>,
    ) -> Result<Self, (DeviceError, Box<dyn KernelSourceProvider>)> {
        match crate::ops::wgpu::GpuContext::new(options) {
            Ok(context) => Ok(Self::from_parts(options, sources, Some(context))),
            Err(e) => Err((e, sources)),
        }
    }

    #[cfg(not(feature = "wgpu"))]
    fn try_initialize_with_sources(
        _options: DeviceOptions,
        sources: Box<dyn KernelSourceProvider>,
    ) -> Result<Self, (DeviceError, Box<dyn KernelSourceProvider>)> {
        Err((DeviceError::Unavailable, sources))
    }

    #[cfg(feature = "wgpu")]
    fn from_parts(
        options: DeviceOptions,
        sources: Box<dyn KernelSourceProvider>,
        context: Option<crate::ops::wgpu::GpuContext>,
    ) -> Self {
        Self(Rc::new(ManagerState {
            options,
            context,
            sources,
            programs: RefCell::new(HashMap::new()),
        }))
    }

    #[cfg(not(feature = "wgpu"))]
    fn from_parts(options: DeviceOptions, sources: Box<dyn KernelSourceProvider>, _context: Option<()>) -> Self {
        Self(Rc::new(ManagerState {
            options,
            sources,
            programs: RefCell::new(HashMap::new()),
        }))
    }

    /// Whether a device context is available.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        #[cfg(feature = "wgpu")]
        {
            self.0.context.is_some()
        }
        #[cfg(not(feature = "wgpu"))]
        {
            false
        }
    }

    /// Options the manager was created with.
    #[must_use]
    pub fn options(&self) -> DeviceOptions {
        self.0.options
    }

    /// Number of cached programs.
    #[must_use]
    pub fn cached_programs(&self) -> usize {
        self.0.programs.borrow().len()
    }

    /// Whether both handles share one manager.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Generates the full source of `template` for program `label`.
    ///
    /// `{{ENTRY}}` is filled with [`entry_point`]`(label)`; every other
    /// `{{KEY}}` comes from `substitutions`. Works on disabled managers too.
    ///
    /// # Errors
    ///
    /// [`DeviceError::SourceNotFound`] if the provider lacks `template`.
    pub fn program_source(
        &self,
        template: &str,
        label: &str,
        substitutions: &[(&str, &str)],
    ) -> Result<String, DeviceError> {
        let text = self
            .0
            .sources
            .template(template)
            .ok_or_else(|| DeviceError::SourceNotFound(template.to_string()))?;
        let mut body = text.replace("{{ENTRY}}", &entry_point(label));
        for (key, value) in substitutions {
            body = body.replace(&format!("{{{{{key}}}}}"), value);
        }
        Ok(precision_header(self.0.options.precision) + &body)
    }

    /// Compiles `source`, reusing a cached program with identical source.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Unavailable`] on a disabled manager, otherwise
    /// [`DeviceError::Compile`] carrying the generated source.
    pub fn create_program(&self, label: &str, source: &str) -> Result<Program, DeviceError> {
        if let Some(program) = self.0.programs.borrow().get(source) {
            debug!(label, "program cache hit");
            return Ok(program.clone());
        }
        let program = self.compile(label, source)?;
        self.0
            .programs
            .borrow_mut()
            .insert(source.to_string(), program.clone());
        Ok(program)
    }

    #[cfg(feature = "wgpu")]
    fn compile(&self, label: &str, source: &str) -> Result<Program, DeviceError> {
        let context = self.0.context.as_ref().ok_or(DeviceError::Unavailable)?;
        let entry = entry_point(label);
        let kernel = context.compile(label, &entry, source)?;
        Ok(Program {
            label: label.to_string(),
            entry,
            kernel: Rc::new(kernel),
        })
    }

    #[cfg(not(feature = "wgpu"))]
    #[allow(clippy::unused_self)]
    fn compile(&self, _label: &str, _source: &str) -> Result<Program, DeviceError> {
        Err(DeviceError::Unavailable)
    }

    /// Dispatches `program` over `output_len` elements and blocks for the
    /// result.
    ///
    /// `dims` is bound as the uniform block; `inputs` follow in binding order.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Unavailable`] on a disabled manager, or
    /// [`DeviceError::Dispatch`].
    #[cfg(feature = "wgpu")]
    pub fn run(
        &self,
        program: &Program,
        dims: [u32; 4],
        inputs: &[&[Real]],
        output_len: usize,
    ) -> Result<Vec<Real>, DeviceError> {
        let context = self.0.context.as_ref().ok_or(DeviceError::Unavailable)?;
        context.run(&program.kernel, dims, inputs, output_len)
    }

    /// Dispatches `program` over `output_len` elements and blocks for the
    /// result.
    ///
    /// # Errors
    ///
    /// Always [`DeviceError::Unavailable`] without the `wgpu` feature.
    #[cfg(not(feature = "wgpu"))]
    #[allow(clippy::unused_self)]
    pub fn run(
        &self,
        _program: &Program,
        _dims: [u32; 4],
        _inputs: &[&[Real]],
        _output_len: usize,
    ) -> Result<Vec<Real>, DeviceError> {
        Err(DeviceError::Unavailable)
    }
}

impl fmt::Debug for KernelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelManager")
            .field("options", &self.0.options)
            .field("enabled", &self.is_enabled())
            .field("cached_programs", &self.cached_programs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceClass;

    struct Fixed;

    impl KernelSourceProvider for Fixed {
        fn template(&self, name: &str) -> Option<Cow<'static, str>> {
            (name == "scale").then(|| Cow::Borrowed("fn {{ENTRY}}() { let k = {{FACTOR}}; }"))
        }
    }

    #[test]
    fn disabled_manager_refuses_programs() {
        let manager = KernelManager::disabled();
        assert!(!manager.is_enabled());
        let src = manager.program_source("activation", "act", &[("ACTIVATION", "return v;")]).unwrap();
        assert!(matches!(
            manager.create_program("act", &src),
            Err(DeviceError::Unavailable)
        ));
        assert_eq!(manager.cached_programs(), 0);
    }

    #[test]
    fn sources_get_header_and_substitutions() {
        let manager = KernelManager::initialize_with_sources(DeviceOptions::default(), Box::new(Fixed));
        let src = manager.program_source("scale", "my-scale", &[("FACTOR", "2.0")]).unwrap();
        let header = precision_header(Precision::default());
        assert!(src.starts_with(&header));
        assert!(src.ends_with("fn k_my_scale() { let k = 2.0; }"));
        assert!(matches!(
            manager.program_source("linear", "x", &[]),
            Err(DeviceError::SourceNotFound(_))
        ));
    }

    #[test]
    fn builtin_templates_have_no_placeholders_left() {
        let manager = KernelManager::disabled();
        for name in ["linear", "activation"] {
            let src = manager
                .program_source(name, name, &[("ACTIVATION", "return v;")])
                .unwrap();
            assert!(!src.contains("{{"), "{name}: {src}");
            assert!(src.contains(&format!("fn k_{name}(")));
        }
    }

    #[test]
    fn double_precision_sources_alias_f64() {
        assert_eq!(precision_header(Precision::Double), "alias Real = f64;\n\n");
        assert_eq!(precision_header(Precision::Single), "alias Real = f32;\n\n");

        let options = DeviceOptions {
            class: DeviceClass::Cpu,
            precision: Precision::Double,
        };
        let manager = KernelManager::initialize_with_sources(options, Box::new(Fixed));
        let src = manager.program_source("scale", "wide", &[("FACTOR", "0.5")]).unwrap();
        assert_eq!(src, "alias Real = f64;\n\nfn k_wide() { let k = 0.5; }");
        assert!(!src.contains("enable"));
    }
}
