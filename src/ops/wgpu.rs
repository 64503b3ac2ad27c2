//! `wgpu` device plumbing.
//!
//! Owns adapter selection, WGSL compilation into compute pipelines and a
//! generic dispatch routine:
//!
//! - binding 0 is a uniform block of four `u32` sizes
//! - bindings `1..=n` are read-only storage buffers, one per input
//! - binding `n + 1` is the read-write output buffer
//!
//! Every kernel uses a workgroup size of [`WORKGROUP_SIZE`] along `x` and is
//! launched with one invocation per output element. Calls block until the
//! result has been read back.

use crate::Real;
use crate::backend::{DeviceClass, DeviceOptions, Precision};
use crate::error::DeviceError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

/// Invocations per workgroup in every builtin kernel.
pub const WORKGROUP_SIZE: u32 = 64;

/// Device and queue used for executing compute pipelines.
pub struct GpuContext {
    /// The logical device.
    pub device: wgpu::Device,
    /// Its submission queue.
    pub queue: wgpu::Queue,
    /// Adapter description, for logs.
    pub info: wgpu::AdapterInfo,
    /// Scalar width of device buffers.
    pub precision: Precision,
}

/// A compiled compute pipeline.
pub struct CompiledKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

fn accepts(class: DeviceClass, ty: wgpu::DeviceType) -> bool {
    use wgpu::DeviceType as T;
    match class {
        DeviceClass::Default | DeviceClass::All => true,
        DeviceClass::Cpu => ty == T::Cpu,
        DeviceClass::Gpu => matches!(ty, T::DiscreteGpu | T::IntegratedGpu | T::VirtualGpu),
        DeviceClass::Accelerator => ty == T::Other,
    }
}

impl GpuContext {
    /// Selects an adapter matching `options` and opens a device on it.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::NoAdapter`] when nothing matches the class
    /// - [`DeviceError::UnsupportedPrecision`] for double precision without
    ///   `SHADER_F64`
    /// - [`DeviceError::Request`] when the device cannot be opened
    pub fn new(options: DeviceOptions) -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::default();
        let adapter = match options.class {
            DeviceClass::Default => {
                pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                    .map_err(|e| DeviceError::NoAdapter(format!("{}: {e}", options.class)))?
            }
            class => instance
                .enumerate_adapters(wgpu::Backends::all())
                .into_iter()
                .find(|a| accepts(class, a.get_info().device_type))
                .ok_or_else(|| DeviceError::NoAdapter(class.to_string()))?,
        };
        let info = adapter.get_info();

        let mut required_features = wgpu::Features::empty();
        if options.precision == Precision::Double {
            if !adapter.features().contains(wgpu::Features::SHADER_F64) {
                return Err(DeviceError::UnsupportedPrecision("double"));
            }
            required_features |= wgpu::Features::SHADER_F64;
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_grad"),
            required_features,
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| DeviceError::Request(e.to_string()))?;

        info!(adapter = %info.name, backend = ?info.backend, kind = ?info.device_type, "device ready");
        Ok(Self {
            device,
            queue,
            info,
            precision: options.precision,
        })
    }

    /// Compiles `source` and builds a pipeline for `entry`.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Compile`] with the diagnostics and the full source.
    pub fn compile(&self, label: &str, entry: &str, source: &str) -> Result<CompiledKernel, DeviceError> {
        let compile_error = |message: String| DeviceError::Compile {
            label: label.to_string(),
            message,
            code: source.to_string(),
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let built = catch_unwind(AssertUnwindSafe(|| {
            let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point: Some(entry),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        }));
        let scope = pollster::block_on(self.device.pop_error_scope());

        let pipeline = built.map_err(|_| compile_error("shader compiler panicked".into()))?;
        if let Some(err) = scope {
            return Err(compile_error(err.to_string()));
        }
        let layout = pipeline.get_bind_group_layout(0);
        debug!(label, entry, "compiled kernel");
        Ok(CompiledKernel { pipeline, layout })
    }

    fn encode(&self, data: &[Real]) -> Vec<u8> {
        match self.precision {
            Precision::Single => {
                let narrow: Vec<f32> = data.iter().map(|&v| v as f32).collect();
                bytemuck::cast_slice(&narrow).to_vec()
            }
            Precision::Double => {
                let wide: Vec<f64> = data.iter().map(|&v| f64::from(v)).collect();
                bytemuck::cast_slice(&wide).to_vec()
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Vec<Real> {
        match self.precision {
            Precision::Single => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as Real)
                .collect(),
            Precision::Double => bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as Real)
                .collect(),
        }
    }

    /// Runs `kernel` over `output_len` elements and reads the result back.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Dispatch`] if the launch exceeds device limits or the
    /// readback fails.
    pub fn run(
        &self,
        kernel: &CompiledKernel,
        dims: [u32; 4],
        inputs: &[&[Real]],
        output_len: usize,
    ) -> Result<Vec<Real>, DeviceError> {
        let groups = (output_len as u32).div_ceil(WORKGROUP_SIZE);
        let max_groups = self.device.limits().max_compute_workgroups_per_dimension;
        if groups > max_groups {
            return Err(DeviceError::Dispatch(format!(
                "{groups} workgroups exceed the device limit of {max_groups}"
            )));
        }
        let out_size = (output_len * self.precision.size()) as u64;

        let dims_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("dims"),
            contents: bytemuck::cast_slice(&dims),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let input_buffers: Vec<wgpu::Buffer> = inputs
            .iter()
            .map(|data| {
                self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("input"),
                    contents: &self.encode(data),
                    usage: wgpu::BufferUsages::STORAGE,
                })
            })
            .collect();
        let output = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output"),
            size: out_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: out_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: dims_buffer.as_entire_binding(),
        }];
        for (i, buffer) in input_buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: inputs.len() as u32 + 1,
            resource: output.as_entire_binding(),
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_bind_group"),
            layout: &kernel.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("kernel_encoder") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("kernel_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&output, 0, &staging, 0, out_size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| DeviceError::Dispatch(e.to_string()))?;
        rx.recv()
            .map_err(|e| DeviceError::Dispatch(e.to_string()))?
            .map_err(|e| DeviceError::Dispatch(e.to_string()))?;

        let result = {
            let mapped = slice.get_mapped_range();
            self.decode(&mapped)
        };
        staging.unmap();
        Ok(result)
    }
}
