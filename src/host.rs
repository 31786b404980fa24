// host.rs — CPU backend with a deferred, optionally out-of-order queue.
//
// `HostDevice` implements the `Device` contract without a GPU. Submissions
// are only recorded; nothing runs until the queue is drained (explicitly,
// or implicitly by `copy_in` / `copy_out`). At that point each queued
// operation runs `Stage::compute_cpu` on the bound buffer ranges.
//
// QUEUE ORDER
// ───────────
//   InOrder     operations run in submission order, like a wgpu queue.
//   OutOfOrder  at every step, one operation whose wait list is fully
//               complete is picked at random (seeded xorshift). Anything
//               a dependency edge does not forbid can and will happen,
//               so a missing edge shows up as corrupted output.
//
// INSTRUMENTATION
// ───────────────
// The device keeps a record of every submission (work item + wait tokens),
// the order in which operations actually executed, per-token timestamps,
// and `HostStats` (submissions, executions, explicit drains, and the
// largest number of operations ever pending at once). Tests use these to
// check dependency sets and the barrier bound. A fault can be injected at
// the k-th submission to exercise error paths.
//
// Submission records and the execution order grow with every submission
// until `clear_records` is called. Completion flags and timestamps are
// indexed by token id, so they keep one small entry per token ever issued
// for the lifetime of the device. Released buffers give their storage back
// immediately; only the empty slot remains.

use std::time::Instant;

use log::{debug, trace};
use serde::Serialize;

use crate::device::{
    check_binding, check_range, BufferRange, Device, Dispatch, QueueOrder, TokenProfile,
};
use crate::error::DeviceError;
use crate::rng::SimpleRng;
use crate::stage::Stage;
use crate::token_pool::WorkItem;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Completion token: the submission's sequence number on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HostToken(u64);

impl HostToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Handle to a host-resident buffer owned by a `HostDevice`.
#[derive(Debug)]
pub struct HostBuffer {
    id: usize,
    len: usize,
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Handle to a stage registered with `load_kernel`.
#[derive(Debug, Clone, Copy)]
pub struct HostKernel(usize);

// ---------------------------------------------------------------------------
// Configuration and statistics
// ---------------------------------------------------------------------------

/// Construction options for `HostDevice`.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub order: QueueOrder,
    /// Seed for out-of-order picks. Ignored for in-order queues.
    pub seed: u64,
    /// Fail the submission with this zero-based index.
    pub fail_at: Option<usize>,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig { order: QueueOrder::InOrder, seed: 0x5eed, fail_at: None }
    }
}

impl HostConfig {
    pub fn out_of_order(seed: u64) -> Self {
        HostConfig { order: QueueOrder::OutOfOrder, seed, fail_at: None }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub submitted: usize,
    pub executed: usize,
    /// Explicit `drain` calls (copies flush the queue without counting).
    pub drains: usize,
    /// Largest queue depth observed right after a submission.
    pub max_pending: usize,
}

/// What was submitted, and what it was told to wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub token: HostToken,
    pub item: WorkItem,
    pub wait: Vec<HostToken>,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    buffer: usize,
    offset: usize,
    len: usize,
}

impl Span {
    fn of(range: BufferRange<'_, HostBuffer>) -> Self {
        Span { buffer: range.buffer.id, offset: range.offset, len: range.len }
    }

    fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

#[derive(Debug)]
struct PendingOp {
    token: HostToken,
    kernel: usize,
    input: Span,
    output: Span,
    wait: Vec<HostToken>,
}

// ---------------------------------------------------------------------------
// HostDevice
// ---------------------------------------------------------------------------

pub struct HostDevice {
    config: HostConfig,
    rng: SimpleRng,
    kernels: Vec<Stage>,
    buffers: Vec<Vec<f32>>,
    pending: Vec<PendingOp>,
    /// Indexed by token id.
    done: Vec<bool>,
    profiles: Vec<TokenProfile>,
    records: Vec<SubmitRecord>,
    executed: Vec<HostToken>,
    stats: HostStats,
    epoch: Instant,
}

impl HostDevice {
    pub fn new(config: HostConfig) -> Self {
        HostDevice {
            rng: SimpleRng::new(config.seed),
            config,
            kernels: Vec::new(),
            buffers: Vec::new(),
            pending: Vec::new(),
            done: Vec::new(),
            profiles: Vec::new(),
            records: Vec::new(),
            executed: Vec::new(),
            stats: HostStats::default(),
            epoch: Instant::now(),
        }
    }

    pub fn in_order() -> Self {
        Self::new(HostConfig::default())
    }

    pub fn out_of_order(seed: u64) -> Self {
        Self::new(HostConfig::out_of_order(seed))
    }

    pub fn stats(&self) -> HostStats {
        self.stats
    }

    /// Every submission so far, in submission order.
    pub fn records(&self) -> &[SubmitRecord] {
        &self.records
    }

    /// Tokens in the order their operations actually ran.
    pub fn execution_order(&self) -> &[HostToken] {
        &self.executed
    }

    /// Forget submission records and the execution order. Tokens stay valid.
    pub fn clear_records(&mut self) {
        self.records.clear();
        self.executed.clear();
    }

    /// Floats currently held by live buffers.
    pub fn allocated_floats(&self) -> usize {
        self.buffers.iter().map(Vec::len).sum()
    }

    /// Operations submitted but not yet executed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_complete(&self, token: HostToken) -> bool {
        self.done.get(token.0 as usize).copied().unwrap_or(false)
    }

    /// Fail the submission with zero-based index `index`.
    pub fn inject_fault_at(&mut self, index: usize) {
        self.config.fail_at = Some(index);
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn is_ready(&self, op: &PendingOp) -> bool {
        op.wait.iter().all(|t| self.done[t.0 as usize])
    }

    /// Run pending operations until the queue is empty.
    fn flush(&mut self) -> Result<(), DeviceError> {
        while !self.pending.is_empty() {
            let next = match self.config.order {
                QueueOrder::InOrder => 0,
                QueueOrder::OutOfOrder => {
                    let ready: Vec<usize> = (0..self.pending.len())
                        .filter(|&i| self.is_ready(&self.pending[i]))
                        .collect();
                    if ready.is_empty() {
                        let pending = self.pending.len();
                        self.pending.clear();
                        return Err(DeviceError::Deadlock { pending });
                    }
                    ready[self.rng.next_usize(ready.len())]
                }
            };
            let op = self.pending.remove(next);
            self.execute(op);
        }
        Ok(())
    }

    fn execute(&mut self, op: PendingOp) {
        let start_ns = self.now_ns();
        // Input and output may share a buffer, so copy the input out first.
        let input = self.buffers[op.input.buffer][op.input.range()].to_vec();
        let output = &mut self.buffers[op.output.buffer][op.output.range()];
        self.kernels[op.kernel].compute_cpu(&input, output);

        let id = op.token.0 as usize;
        self.done[id] = true;
        self.profiles[id].start_ns = start_ns;
        self.profiles[id].end_ns = self.now_ns();
        self.executed.push(op.token);
        self.stats.executed += 1;
        trace!("host: ran token {}", op.token.0);
    }
}

impl Device for HostDevice {
    type Token = HostToken;
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn describe(&self) -> String {
        match self.config.order {
            QueueOrder::InOrder => "host (in-order)".to_string(),
            QueueOrder::OutOfOrder => format!("host (out-of-order, seed {})", self.config.seed),
        }
    }

    fn queue_order(&self) -> QueueOrder {
        self.config.order
    }

    fn load_kernel(&mut self, stage: &Stage) -> Result<HostKernel, DeviceError> {
        debug!("host: kernel `{}` for {}", stage.kernel(), stage);
        self.kernels.push(stage.clone());
        Ok(HostKernel(self.kernels.len() - 1))
    }

    fn create_buffer(&mut self, label: &str, len: usize) -> Result<HostBuffer, DeviceError> {
        trace!("host: buffer `{label}` ({len} floats)");
        self.buffers.push(vec![0.0; len]);
        Ok(HostBuffer { id: self.buffers.len() - 1, len })
    }

    fn submit(
        &mut self,
        dispatch: Dispatch<'_, HostKernel, HostBuffer>,
        wait: &[HostToken],
    ) -> Result<HostToken, DeviceError> {
        let index = self.stats.submitted;
        if self.config.fail_at == Some(index) {
            return Err(DeviceError::InjectedFault(index));
        }

        let issued = self.done.len() as u64;
        if let Some(bad) = wait.iter().find(|t| t.0 >= issued) {
            return Err(DeviceError::UnknownToken(bad.0));
        }

        let stage = &self.kernels[dispatch.kernel.0];
        check_binding(stage.name(), "input", stage.input_shape().len(), dispatch.input.len)?;
        check_binding(stage.name(), "output", stage.output_shape().len(), dispatch.output.len)?;
        check_range(dispatch.input.offset, dispatch.input.len, dispatch.input.buffer.len)?;
        check_range(dispatch.output.offset, dispatch.output.len, dispatch.output.buffer.len)?;

        let token = HostToken(issued);
        let queued_ns = self.now_ns();
        self.done.push(false);
        self.profiles.push(TokenProfile { queued_ns, start_ns: 0, end_ns: 0 });
        self.records.push(SubmitRecord { token, item: dispatch.item, wait: wait.to_vec() });
        self.pending.push(PendingOp {
            token,
            kernel: dispatch.kernel.0,
            input: Span::of(dispatch.input),
            output: Span::of(dispatch.output),
            wait: wait.to_vec(),
        });

        self.stats.submitted += 1;
        self.stats.max_pending = self.stats.max_pending.max(self.pending.len());
        Ok(token)
    }

    fn copy_in(
        &mut self,
        dst: &HostBuffer,
        offset: usize,
        data: &[f32],
    ) -> Result<(), DeviceError> {
        check_range(offset, data.len(), dst.len)?;
        self.flush()?;
        self.buffers[dst.id][offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn copy_out(
        &mut self,
        src: &HostBuffer,
        offset: usize,
        out: &mut [f32],
    ) -> Result<(), DeviceError> {
        check_range(offset, out.len(), src.len)?;
        self.flush()?;
        out.copy_from_slice(&self.buffers[src.id][offset..offset + out.len()]);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        self.stats.drains += 1;
        trace!("host: drain #{} ({} pending)", self.stats.drains, self.pending.len());
        self.flush()
    }

    fn release_buffer(&mut self, buffer: HostBuffer) -> Result<(), DeviceError> {
        self.flush()?;
        trace!("host: release buffer {} ({} floats)", buffer.id, buffer.len);
        self.buffers[buffer.id] = Vec::new();
        Ok(())
    }

    fn profile(&self, token: &HostToken) -> Option<TokenProfile> {
        if self.is_complete(*token) {
            self.profiles.get(token.0 as usize).copied()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    /// One-element stage computing `x²`.
    fn square() -> Stage {
        Stage::distance("square", Shape::flat(1), 1, vec![0.0]).unwrap()
    }

    fn submit_square(
        dev: &mut HostDevice,
        k: &HostKernel,
        buf: &HostBuffer,
        from: usize,
        to: usize,
        wait: &[HostToken],
    ) -> Result<HostToken, DeviceError> {
        dev.submit(
            Dispatch {
                item: WorkItem::new(0, to),
                kernel: k,
                input: BufferRange::new(buf, from, 1),
                output: BufferRange::new(buf, to, 1),
                work: square().work_shape(),
            },
            wait,
        )
    }

    #[test]
    fn test_in_order_chain() {
        let mut dev = HostDevice::in_order();
        let k = dev.load_kernel(&square()).unwrap();
        let buf = dev.create_buffer("b", 3).unwrap();
        dev.copy_in(&buf, 0, &[2.0]).unwrap();

        let t0 = submit_square(&mut dev, &k, &buf, 0, 1, &[]).unwrap();
        let t1 = submit_square(&mut dev, &k, &buf, 1, 2, &[t0]).unwrap();
        assert_eq!(dev.pending(), 2);
        assert!(!dev.is_complete(t1));

        let mut out = [0.0; 3];
        dev.copy_out(&buf, 0, &mut out).unwrap();
        assert_eq!(out, [2.0, 4.0, 16.0]);
        assert_eq!(dev.execution_order(), &[t0, t1]);
        assert!(dev.profile(&t1).is_some());
        // Copies flush without counting as drains.
        assert_eq!(dev.stats().drains, 0);
    }

    #[test]
    fn test_out_of_order_respects_waits() {
        for seed in 1..20 {
            let mut dev = HostDevice::out_of_order(seed);
            let k = dev.load_kernel(&square()).unwrap();
            let buf = dev.create_buffer("b", 4).unwrap();
            dev.copy_in(&buf, 0, &[1.5]).unwrap();
            let t0 = submit_square(&mut dev, &k, &buf, 0, 1, &[]).unwrap();
            let t1 = submit_square(&mut dev, &k, &buf, 1, 2, &[t0]).unwrap();
            let t2 = submit_square(&mut dev, &k, &buf, 2, 3, &[t1]).unwrap();
            dev.drain().unwrap();
            assert_eq!(dev.execution_order(), &[t0, t1, t2], "seed {seed}");
        }
    }

    #[test]
    fn test_out_of_order_reorders_independent_work() {
        let reordered = (1..20u64).any(|seed| {
            let mut dev = HostDevice::out_of_order(seed);
            let k = dev.load_kernel(&square()).unwrap();
            let buf = dev.create_buffer("b", 16).unwrap();
            let tokens: Vec<HostToken> = (0..8)
                .map(|i| submit_square(&mut dev, &k, &buf, i, 8 + i, &[]).unwrap())
                .collect();
            dev.drain().unwrap();
            dev.execution_order() != tokens.as_slice()
        });
        assert!(reordered);
    }

    #[test]
    fn test_unknown_wait_token() {
        let mut dev = HostDevice::in_order();
        let k = dev.load_kernel(&square()).unwrap();
        let buf = dev.create_buffer("b", 2).unwrap();
        let err = submit_square(&mut dev, &k, &buf, 0, 1, &[HostToken(5)]).unwrap_err();
        assert!(matches!(err, DeviceError::UnknownToken(5)));
    }

    #[test]
    fn test_out_of_range_binding() {
        let mut dev = HostDevice::in_order();
        let k = dev.load_kernel(&square()).unwrap();
        let buf = dev.create_buffer("b", 2).unwrap();
        let err = submit_square(&mut dev, &k, &buf, 0, 2, &[]).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfRange { offset: 2, len: 1, capacity: 2 }));
        assert!(dev.copy_in(&buf, 1, &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_binding_size_mismatch() {
        let mut dev = HostDevice::in_order();
        let k = dev.load_kernel(&square()).unwrap();
        let buf = dev.create_buffer("b", 4).unwrap();
        let err = dev
            .submit(
                Dispatch {
                    item: WorkItem::new(0, 0),
                    kernel: &k,
                    input: BufferRange::new(&buf, 0, 2),
                    output: BufferRange::new(&buf, 2, 1),
                    work: square().work_shape(),
                },
                &[],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::BindingSize { what: "input", expected: 1, actual: 2, .. }
        ));
    }

    #[test]
    fn test_injected_fault() {
        let mut dev = HostDevice::new(HostConfig { fail_at: Some(1), ..HostConfig::default() });
        let k = dev.load_kernel(&square()).unwrap();
        let buf = dev.create_buffer("b", 3).unwrap();
        submit_square(&mut dev, &k, &buf, 0, 1, &[]).unwrap();
        let err = submit_square(&mut dev, &k, &buf, 1, 2, &[]).unwrap_err();
        assert!(matches!(err, DeviceError::InjectedFault(1)));
        assert_eq!(dev.stats().submitted, 1);
    }

    #[test]
    fn test_release_buffer_frees_storage() {
        let mut dev = HostDevice::in_order();
        let k = dev.load_kernel(&square()).unwrap();
        let keep = dev.create_buffer("keep", 4).unwrap();
        let gone = dev.create_buffer("gone", 1000).unwrap();
        assert_eq!(dev.allocated_floats(), 1004);

        dev.copy_in(&gone, 0, &[3.0]).unwrap();
        submit_square(&mut dev, &k, &keep, 0, 1, &[]).unwrap();
        dev.release_buffer(gone).unwrap();
        // Pending work ran before the storage went away.
        assert_eq!(dev.pending(), 0);
        assert_eq!(dev.allocated_floats(), 4);
    }

    #[test]
    fn test_clear_records_keeps_tokens_valid() {
        let mut dev = HostDevice::in_order();
        let k = dev.load_kernel(&square()).unwrap();
        let buf = dev.create_buffer("b", 3).unwrap();
        let t0 = submit_square(&mut dev, &k, &buf, 0, 1, &[]).unwrap();
        dev.drain().unwrap();
        dev.clear_records();
        assert!(dev.records().is_empty());
        assert!(dev.execution_order().is_empty());
        assert!(dev.is_complete(t0));

        let t1 = submit_square(&mut dev, &k, &buf, 1, 2, &[t0]).unwrap();
        dev.drain().unwrap();
        assert_eq!(dev.records().len(), 1);
        assert_eq!(dev.execution_order(), &[t1]);
    }

    #[test]
    fn test_max_pending_tracks_queue_depth() {
        let mut dev = HostDevice::in_order();
        let k = dev.load_kernel(&square()).unwrap();
        let buf = dev.create_buffer("b", 8).unwrap();
        for i in 0..3 {
            submit_square(&mut dev, &k, &buf, i, 4 + i, &[]).unwrap();
        }
        dev.drain().unwrap();
        submit_square(&mut dev, &k, &buf, 0, 7, &[]).unwrap();
        dev.drain().unwrap();
        let stats = dev.stats();
        assert_eq!(stats.max_pending, 3);
        assert_eq!(stats.executed, 4);
        assert_eq!(stats.drains, 2);
    }
}
