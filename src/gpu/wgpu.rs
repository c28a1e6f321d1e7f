//! `wgpu`-backed implementation of the [`GpuRuntime`] contract.
//!
//! Programs are WGSL compute shaders compiled into pipelines once per
//! [`ProgramKind`]; buffers are persistent storage buffers registered under
//! opaque handles. Dispatch writes into a device-resident output buffer and
//! returns without any host transfer; `read_back` stages the buffer into a
//! mappable copy and blocks until it is host-visible.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use log::{debug, trace};
use wgpu::util::DeviceExt;

use super::{BufferId, GpuError, GpuRuntime, ProgramId, ProgramKind, Uniform};
use crate::activations::Activation;

fn resolve(buffers: &[wgpu::Buffer], id: BufferId) -> Result<&wgpu::Buffer, GpuError> {
    buffers.get(id.0).ok_or(GpuError::UnknownBuffer(id))
}

const AFFINE: &str = include_str!("shaders/affine.wgsl");
const RELU: &str = include_str!("shaders/relu.wgsl");
const SIGMOID: &str = include_str!("shaders/sigmoid.wgsl");
const TANH: &str = include_str!("shaders/tanh.wgsl");
const SOFTPLUS: &str = include_str!("shaders/softplus.wgsl");

struct ProgramEntry {
    kind: ProgramKind,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

/// Compute runtime holding a `wgpu` device, its queue, and the registries
/// of compiled pipelines and live buffers.
pub struct WgpuRuntime {
    device: wgpu::Device,
    queue: wgpu::Queue,
    programs: Mutex<Vec<ProgramEntry>>,
    buffers: Mutex<Vec<wgpu::Buffer>>,
    readbacks: AtomicUsize,
}

impl WgpuRuntime {
    /// Acquires the default adapter and creates a device + queue.
    ///
    /// # Errors
    ///
    /// Returns [`GpuError::Init`] if adapter or device acquisition fails;
    /// a layer constructed against a failed runtime cannot be used.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(|e| GpuError::Init(e.to_string()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| GpuError::Init(e.to_string()))?;

        debug!("wgpu runtime ready on {:?}", adapter.get_info().name);

        Ok(Self {
            device,
            queue,
            programs: Mutex::new(Vec::new()),
            buffers: Mutex::new(Vec::new()),
            readbacks: AtomicUsize::new(0),
        })
    }

    fn shader_for(kind: ProgramKind) -> Result<(&'static str, &'static str), GpuError> {
        match kind {
            ProgramKind::Affine => Ok(("affine", AFFINE)),
            ProgramKind::Activation(Activation::Relu) => Ok(("relu", RELU)),
            ProgramKind::Activation(Activation::Sigmoid) => Ok(("sigmoid", SIGMOID)),
            ProgramKind::Activation(Activation::Tanh) => Ok(("tanh", TANH)),
            ProgramKind::Activation(Activation::Softplus) => Ok(("softplus", SOFTPLUS)),
            ProgramKind::Activation(Activation::Identity) => {
                Err(GpuError::UnsupportedProgram(kind))
            }
        }
    }

    fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }

    fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }

    fn layout_for(&self, kind: ProgramKind, label: &str) -> wgpu::BindGroupLayout {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = match kind {
            // dims uniform, x, w, bias, y
            ProgramKind::Affine => vec![
                Self::uniform_entry(0),
                Self::storage_entry(1, true),
                Self::storage_entry(2, true),
                Self::storage_entry(3, true),
                Self::storage_entry(4, false),
            ],
            // x, y
            ProgramKind::Activation(_) => {
                vec![Self::storage_entry(0, true), Self::storage_entry(1, false)]
            }
        };
        self.device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &entries,
            })
    }

    fn affine_dims(uniforms: &[Uniform]) -> Result<[u32; 4], GpuError> {
        let get = |name: &'static str| -> Result<u32, GpuError> {
            uniforms
                .iter()
                .find(|u| u.name == name)
                .map(|u| u.value)
                .ok_or(GpuError::MissingUniform(name))
        };
        Ok([get("m")?, get("k")?, get("n")?, get("add_bias")?])
    }
}

impl GpuRuntime for WgpuRuntime {
    fn compile(&self, kind: ProgramKind) -> Result<ProgramId, GpuError> {
        let (label, source) = Self::shader_for(kind)?;

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let layout = self.layout_for(kind, label);
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                cache: None,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });

        debug!("compiled `{label}` compute pipeline");

        let mut programs = self.programs.lock().expect("program registry poisoned");
        programs.push(ProgramEntry {
            kind,
            layout,
            pipeline,
        });
        Ok(ProgramId(programs.len() - 1))
    }

    fn alloc(&self, len: usize) -> Result<BufferId, GpuError> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: (len * size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let mut buffers = self.buffers.lock().expect("buffer registry poisoned");
        buffers.push(buffer);
        Ok(BufferId(buffers.len() - 1))
    }

    fn upload(&self, data: &[f32]) -> Result<BufferId, GpuError> {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            });
        let mut buffers = self.buffers.lock().expect("buffer registry poisoned");
        buffers.push(buffer);
        Ok(BufferId(buffers.len() - 1))
    }

    fn run(
        &self,
        program: ProgramId,
        inputs: &[BufferId],
        output: BufferId,
        uniforms: &[Uniform],
    ) -> Result<(), GpuError> {
        let programs = self.programs.lock().expect("program registry poisoned");
        let entry = programs
            .get(program.0)
            .ok_or(GpuError::UnknownProgram(program))?;
        let buffers = self.buffers.lock().expect("buffer registry poisoned");
        let out_buffer = resolve(&buffers, output)?;

        let dims_buffer;
        let mut entries: Vec<wgpu::BindGroupEntry> = Vec::new();
        let mut binding = 0;
        if entry.kind == ProgramKind::Affine {
            let dims = Self::affine_dims(uniforms)?;
            dims_buffer = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("dims"),
                    contents: bytemuck::cast_slice(&dims),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: dims_buffer.as_entire_binding(),
            });
            binding += 1;
        }
        for &id in inputs {
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: resolve(&buffers, id)?.as_entire_binding(),
            });
            binding += 1;
        }
        entries.push(wgpu::BindGroupEntry {
            binding,
            resource: out_buffer.as_entire_binding(),
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &entry.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&entry.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            match entry.kind {
                ProgramKind::Affine => {
                    let dims = Self::affine_dims(uniforms)?;
                    pass.dispatch_workgroups(dims[2].div_ceil(16), dims[0].div_ceil(16), 1);
                }
                ProgramKind::Activation(_) => {
                    let len = (out_buffer.size() / size_of::<f32>() as u64) as u32;
                    pass.dispatch_workgroups(len.div_ceil(64), 1, 1);
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_back(&self, buffer: BufferId, out: &mut [f32]) -> Result<(), GpuError> {
        let buffers = self.buffers.lock().expect("buffer registry poisoned");
        let src = buffers.get(buffer.0).ok_or(GpuError::UnknownBuffer(buffer))?;

        let size = (out.len() * size_of::<f32>()) as u64;
        if src.size() != size {
            return Err(GpuError::Transfer(format!(
                "buffer holds {} bytes, host target holds {size}",
                src.size()
            )));
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            assert!(result.is_ok());
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| GpuError::Transfer(format!("poll failed: {e:?}")))?;

        let data = slice.get_mapped_range();
        out.copy_from_slice(bytemuck::cast_slice(&data));
        drop(data);
        staging.unmap();

        self.readbacks.fetch_add(1, Ordering::Relaxed);
        trace!("read back {} elements", out.len());
        Ok(())
    }

    fn readback_count(&self) -> usize {
        self.readbacks.load(Ordering::Relaxed)
    }
}
