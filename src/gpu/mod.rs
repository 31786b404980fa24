// gpu/mod.rs — wgpu compute backend.
//
// `device` owns adapter selection and the wgpu device/queue pair;
// `backend` implements the crate's `Device` trait on top of it with one WGSL
// kernel per stage kind. The CPU path in `stage.rs` stays the reference:
// every kernel is checked against `Stage::compute_cpu` within `TOLERANCE`.
//
//   Pipeline<GpuBackend>
//        │ load_kernel        shader = common.wgsl + <kind>.wgsl
//        │ create_buffer      STORAGE | COPY_SRC | COPY_DST
//        ▼
//   submit ──▶ wgpu::Queue (in order) ──▶ copy_out (staging + map_async)

pub mod backend;
pub mod device;

pub use backend::{GpuBackend, GpuBuffer, GpuKernel, GpuToken};
pub use device::{DeviceProfile, GpuDevice, GpuError, WorkgroupSize};
