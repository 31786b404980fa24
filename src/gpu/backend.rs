// gpu/backend.rs — `Device` implementation on a wgpu compute queue.
//
// Each stage becomes one compute pipeline built from `common.wgsl` plus
// the kernel file for its kind, with the workgroup size baked in by string
// replacement ({{WG_X}} / {{WG_Y}}). Weights and biases are uploaded once
// into read-only storage buffers owned by the kernel.
//
// Every `submit` records one compute pass into its own command buffer and
// submits it. The queue runs submissions in order, so the wait list only
// needs to be validated, not encoded.
//
// BIND GROUP LAYOUT (shared by all kernels)
// ─────────────────────────────────────────
//   0  src      storage, read        whole input buffer
//   1  dst      storage, read_write  whole output buffer
//   2  weights  storage, read        ≥ 1 element (padded when empty)
//   3  biases   storage, read        ≥ 1 element (padded when empty)
//   4  params   uniform              KernelParams, 48 bytes
//
// Storage binding offsets must be 256-byte aligned, and an input slot
// (n · in_size floats) generally is not, so the full buffer is bound and the
// element offset travels in `params`.
//
// NEW WGPU CONCEPTS:
// - Error scopes: `push_error_scope(Validation)` around shader and pipeline
//   creation turns a WGSL or entry-point error into a value we can return
//   as `DeviceError::KernelBuild`, instead of the default handler's panic.
// - `copy_buffer_to_buffer` into a MAP_READ staging buffer, then
//   `map_async` + `poll(Wait)`, is the readback path; storage buffers
//   cannot be mapped directly.

use std::sync::mpsc;

use log::{debug, trace};
use wgpu::util::DeviceExt;

use crate::device::{check_binding, check_range, Device, Dispatch, QueueOrder};
use crate::error::DeviceError;
use crate::gpu::device::{GpuDevice, WorkgroupSize};
use crate::stage::{PoolMode, Stage, StageKind};

const COMMON_WGSL: &str = include_str!("../shaders/common.wgsl");

fn kernel_source(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Conv => include_str!("../shaders/conv.wgsl"),
        StageKind::Pool(_) => include_str!("../shaders/pool.wgsl"),
        StageKind::FullConnect => include_str!("../shaders/full.wgsl"),
        StageKind::Distance => include_str!("../shaders/distance.wgsl"),
    }
}

fn shader_source(kind: StageKind, wg: WorkgroupSize) -> String {
    format!("{COMMON_WGSL}\n{}", kernel_source(kind))
        .replace("{{WG_X}}", &wg.x.to_string())
        .replace("{{WG_Y}}", &wg.y.to_string())
}

// ---------------------------------------------------------------------------
// Kernel params uniform (must match `Params` in common.wgsl)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct KernelParams {
    in_w: u32,
    in_h: u32,
    in_d: u32,
    out_w: u32,
    out_h: u32,
    out_d: u32,
    kernel_size: u32,
    in_offset: u32,
    out_offset: u32,
    in_len: u32,
    mode: u32,
    _pad: u32,
}

impl KernelParams {
    fn for_stage(stage: &Stage) -> Self {
        let (i, o) = (stage.input_shape(), stage.output_shape());
        KernelParams {
            in_w: i.width as u32,
            in_h: i.height as u32,
            in_d: i.depth as u32,
            out_w: o.width as u32,
            out_h: o.height as u32,
            out_d: o.depth as u32,
            kernel_size: stage.kernel_size() as u32,
            in_offset: 0,
            out_offset: 0,
            in_len: i.len() as u32,
            mode: match stage.kind() {
                StageKind::Pool(PoolMode::Max) => 1,
                _ => 0,
            },
            _pad: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Completion token: submission counter on this backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuToken(u64);

/// Device-resident f32 buffer.
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

impl GpuBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Compiled pipeline plus parameter buffers for one stage.
pub struct GpuKernel {
    name: String,
    pipeline: wgpu::ComputePipeline,
    weights: wgpu::Buffer,
    biases: wgpu::Buffer,
    params: KernelParams,
    in_len: usize,
    out_len: usize,
    workgroup: WorkgroupSize,
}

// ---------------------------------------------------------------------------
// GpuBackend
// ---------------------------------------------------------------------------

pub struct GpuBackend {
    bgl: wgpu::BindGroupLayout,
    layout: wgpu::PipelineLayout,
    submitted: u64,
    /// Declared last: bind group and pipeline layouts drop before the device.
    gpu: GpuDevice,
}

impl GpuBackend {
    /// Open the default adapter.
    pub fn open() -> Result<Self, DeviceError> {
        Ok(Self::new(GpuDevice::new()?))
    }

    pub fn new(gpu: GpuDevice) -> Self {
        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("stage BGL"),
            entries: &[
                storage(0, true),
                storage(1, false),
                storage(2, true),
                storage(3, true),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("stage pipeline layout"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        GpuBackend { bgl, layout, submitted: 0, gpu }
    }

    pub fn gpu(&self) -> &GpuDevice {
        &self.gpu
    }

    fn upload_params(&self, label: &str, data: &[f32]) -> wgpu::Buffer {
        // Zero-sized storage bindings are invalid.
        let padded = [0.0f32];
        let contents: &[f32] = if data.is_empty() { &padded } else { data };
        self.gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(contents),
            usage: wgpu::BufferUsages::STORAGE,
        })
    }
}

impl Device for GpuBackend {
    type Token = GpuToken;
    type Buffer = GpuBuffer;
    type Kernel = GpuKernel;

    fn describe(&self) -> String {
        format!("gpu {}", self.gpu)
    }

    fn queue_order(&self) -> QueueOrder {
        QueueOrder::InOrder
    }

    fn load_kernel(&mut self, stage: &Stage) -> Result<GpuKernel, DeviceError> {
        let workgroup = match stage.work_group() {
            Some([x, y]) => {
                let wg = WorkgroupSize { x, y };
                self.gpu.check_workgroup_size(wg)?;
                wg
            }
            None => self.gpu.workgroup_size,
        };

        let device = &self.gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(stage.name()),
            source: wgpu::ShaderSource::Wgsl(shader_source(stage.kind(), workgroup).into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(stage.name()),
            layout: Some(&self.layout),
            module: &module,
            entry_point: stage.kernel(),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(DeviceError::KernelBuild {
                stage: stage.name().to_string(),
                message: err.to_string(),
            });
        }
        debug!("gpu: built `{}` for {} (workgroup {workgroup})", stage.kernel(), stage.name());

        Ok(GpuKernel {
            name: stage.name().to_string(),
            pipeline,
            weights: self.upload_params(&format!("{} weights", stage.name()), stage.weights()),
            biases: self.upload_params(&format!("{} biases", stage.name()), stage.biases()),
            params: KernelParams::for_stage(stage),
            in_len: stage.input_shape().len(),
            out_len: stage.output_shape().len(),
            workgroup,
        })
    }

    fn create_buffer(&mut self, label: &str, len: usize) -> Result<GpuBuffer, DeviceError> {
        let max = self.gpu.max_storage_floats();
        check_range(0, len, max)?;
        trace!("gpu: buffer `{label}` ({len} floats)");
        let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (len.max(1) * std::mem::size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Ok(GpuBuffer { buffer, len })
    }

    fn submit(
        &mut self,
        dispatch: Dispatch<'_, GpuKernel, GpuBuffer>,
        wait: &[GpuToken],
    ) -> Result<GpuToken, DeviceError> {
        if let Some(bad) = wait.iter().find(|t| t.0 >= self.submitted) {
            return Err(DeviceError::UnknownToken(bad.0));
        }
        let kernel = dispatch.kernel;
        check_binding(&kernel.name, "input", kernel.in_len, dispatch.input.len)?;
        check_binding(&kernel.name, "output", kernel.out_len, dispatch.output.len)?;
        check_range(dispatch.input.offset, dispatch.input.len, dispatch.input.buffer.len)?;
        check_range(dispatch.output.offset, dispatch.output.len, dispatch.output.buffer.len)?;

        let params = KernelParams {
            in_offset: dispatch.input.offset as u32,
            out_offset: dispatch.output.offset as u32,
            ..kernel.params
        };
        let device = &self.gpu.device;
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("KernelParams"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&kernel.name),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: dispatch.input.buffer.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: dispatch.output.buffer.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry { binding: 2, resource: kernel.weights.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: kernel.biases.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: params_buf.as_entire_binding() },
            ],
        });

        let (x, y, z) = kernel.workgroup.dispatch_for(dispatch.work);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&kernel.name),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&kernel.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, z);
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let token = GpuToken(self.submitted);
        self.submitted += 1;
        trace!("gpu: {} → token {}", dispatch.item, token.0);
        Ok(token)
    }

    fn copy_in(&mut self, dst: &GpuBuffer, offset: usize, data: &[f32]) -> Result<(), DeviceError> {
        check_range(offset, data.len(), dst.len)?;
        if data.is_empty() {
            return Ok(());
        }
        let byte_offset = (offset * std::mem::size_of::<f32>()) as u64;
        self.gpu.queue.write_buffer(&dst.buffer, byte_offset, bytemuck::cast_slice(data));
        Ok(())
    }

    fn copy_out(
        &mut self,
        src: &GpuBuffer,
        offset: usize,
        out: &mut [f32],
    ) -> Result<(), DeviceError> {
        check_range(offset, out.len(), src.len)?;
        if out.is_empty() {
            return Ok(());
        }
        let size = std::mem::size_of_val(out) as u64;
        let byte_offset = (offset * std::mem::size_of::<f32>()) as u64;

        let device = &self.gpu.device;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_buffer_to_buffer(&src.buffer, byte_offset, &staging, 0, size);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            // The receiver outlives the poll below; a send error means it
            // was dropped early and there is nobody left to tell.
            let _ = tx.send(r);
        });
        device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| DeviceError::Readback("map callback never fired".to_string()))?
            .map_err(|e| DeviceError::Readback(e.to_string()))?;

        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(bytemuck::cast_slice(&mapped));
        }
        staging.unmap();
        Ok(())
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        self.gpu.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
