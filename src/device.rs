// device.rs — The narrow contract between the scheduler and a compute backend.
//
// A backend owns a single command queue. Work is submitted as a `Dispatch`
// (one stage applied to one input) together with the tokens of earlier
// submissions it must wait for; `submit` returns a new token immediately and
// never blocks. Synchronisation happens only in `drain` and `copy_out`.
//
//   scheduler ──submit(dispatch, wait)──▶ backend queue ──▶ token
//             ──drain()─────────────────▶ block until the queue is empty
//             ──copy_out(buffer)────────▶ block, then read results
//
// Two implementations live in this crate:
//   host::HostDevice   — deferred CPU queue running `Stage::compute_cpu`,
//                        optionally executing ready work out of order.
//   gpu::GpuBackend    — wgpu compute queue with one WGSL kernel per kind.
//
// Buffers hold f32 elements. Offsets and lengths in this API are counted in
// elements, never bytes.
//
// NEW RUST CONCEPTS:
// - Associated types (`type Token`, `type Buffer`, `type Kernel`) let each
//   backend pick its own handle types while generic code such as
//   `Pipeline<D: Device>` stays fully static (no trait objects, no boxing).
// - Hand-written `Clone`/`Copy` impls on `BufferRange<'a, B>`: `#[derive]`
//   would require `B: Copy`, but we only copy the reference, never `B`.

use std::fmt;

use serde::Serialize;

use crate::error::DeviceError;
use crate::stage::Stage;
use crate::token_pool::WorkItem;

/// Execution order of a backend's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueOrder {
    /// Work runs strictly in submission order; wait lists are implied.
    InOrder,
    /// Any submitted work whose wait list is satisfied may run next.
    OutOfOrder,
}

impl fmt::Display for QueueOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueOrder::InOrder => write!(f, "in-order"),
            QueueOrder::OutOfOrder => write!(f, "out-of-order"),
        }
    }
}

/// Global 3D work size of one dispatch, one invocation per output element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkShape {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkShape {
    pub fn invocations(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// `len` elements of `buffer` starting at element `offset`.
#[derive(Debug)]
pub struct BufferRange<'a, B> {
    pub buffer: &'a B,
    pub offset: usize,
    pub len: usize,
}

impl<'a, B> BufferRange<'a, B> {
    pub fn new(buffer: &'a B, offset: usize, len: usize) -> Self {
        BufferRange { buffer, offset, len }
    }

    /// One past the last element covered.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

impl<B> Clone for BufferRange<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for BufferRange<'_, B> {}

/// One unit of work handed to `Device::submit`.
#[derive(Debug)]
pub struct Dispatch<'a, K, B> {
    pub item: WorkItem,
    pub kernel: &'a K,
    pub input: BufferRange<'a, B>,
    pub output: BufferRange<'a, B>,
    pub work: WorkShape,
}

/// Timestamps for one submission, in nanoseconds since the backend was
/// created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenProfile {
    pub queued_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl TokenProfile {
    /// Time spent executing.
    pub fn run_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }

    /// Time between submission and the start of execution.
    pub fn wait_ns(&self) -> u64 {
        self.start_ns.saturating_sub(self.queued_ns)
    }
}

/// A queue-based compute backend.
pub trait Device {
    /// Completion handle for one submission. Never reused within a device.
    type Token: Clone + fmt::Debug;
    /// Device-resident f32 storage.
    type Buffer;
    /// Executable form of one stage.
    type Kernel;

    /// Human-readable backend description for logs and reports.
    fn describe(&self) -> String;

    fn queue_order(&self) -> QueueOrder;

    /// Build the executable kernel for `stage`.
    fn load_kernel(&mut self, stage: &Stage) -> Result<Self::Kernel, DeviceError>;

    /// Allocate a buffer of `len` f32 elements.
    fn create_buffer(&mut self, label: &str, len: usize) -> Result<Self::Buffer, DeviceError>;

    /// Enqueue `dispatch` to run after every token in `wait` has completed.
    fn submit(
        &mut self,
        dispatch: Dispatch<'_, Self::Kernel, Self::Buffer>,
        wait: &[Self::Token],
    ) -> Result<Self::Token, DeviceError>;

    /// Write `data` into `dst` starting at element `offset`. Ordered before
    /// every later submission.
    fn copy_in(
        &mut self,
        dst: &Self::Buffer,
        offset: usize,
        data: &[f32],
    ) -> Result<(), DeviceError>;

    /// Read `out.len()` elements from `src` starting at element `offset`,
    /// after all previously submitted work has completed.
    fn copy_out(
        &mut self,
        src: &Self::Buffer,
        offset: usize,
        out: &mut [f32],
    ) -> Result<(), DeviceError>;

    /// Block until every submitted operation has completed.
    fn drain(&mut self) -> Result<(), DeviceError>;

    /// Return `buffer`'s storage to the backend. Work already submitted
    /// against it completes first.
    fn release_buffer(&mut self, buffer: Self::Buffer) -> Result<(), DeviceError> {
        drop(buffer);
        Ok(())
    }

    /// Timing for a completed token, if the backend records it.
    fn profile(&self, _token: &Self::Token) -> Option<TokenProfile> {
        None
    }
}

/// Check that `[offset, offset + len)` lies inside a buffer of `capacity`
/// elements.
pub(crate) fn check_range(offset: usize, len: usize, capacity: usize) -> Result<(), DeviceError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(DeviceError::OutOfRange { offset, len, capacity }),
    }
}

/// Check that a dispatch binds exactly the number of elements a kernel
/// reads or writes.
pub(crate) fn check_binding(
    stage: &str,
    what: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), DeviceError> {
    if expected == actual {
        Ok(())
    } else {
        Err(DeviceError::BindingSize { stage: stage.to_string(), what, expected, actual })
    }
}
