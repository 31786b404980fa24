// scheduler.rs — Drive N inputs through a pipeline.
//
// Every input visits every stage, so a run issues N·S work items, always in
// (sequence, stage) order. The two modes differ only in the wait lists:
//
//   Batched    (s, n) waits on (s - 1, n) only. Nothing stops input n + 1
//              from overwriting a boundary buffer that input n has not read
//              yet, so this is only correct on an in-order queue, where the
//              queue itself serialises everything. Rejected on out-of-order
//              devices.
//
//   Pipelined  (s, n) waits on the tokens the DependencyTokenPool resolves
//              for it: its data producer and the previous reader of the
//              buffer it overwrites. Correct on any queue; on an
//              out-of-order queue it lets stages of consecutive inputs
//              overlap.
//
// BARRIERS
// ────────
// After every `queue_barrier` inputs the scheduler drains the device. This
// bounds the number of in-flight operations to `queue_barrier · S` and
// keeps an out-of-order queue from accumulating the whole run.
//
// ERRORS
// ──────
// A failing submission or barrier aborts the run. Work already submitted
// may still reference pipeline buffers, so the device is drained before
// the error is returned.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::device::{Device, QueueOrder};
use crate::error::{ConfigError, Result};
use crate::pipeline::Pipeline;
use crate::token_pool::{DependencyTokenPool, WorkItem};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Batched,
    Pipelined,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Batched => write!(f, "batched"),
            ExecutionMode::Pipelined => write!(f, "pipelined"),
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mode: ExecutionMode,
    /// Inputs issued between two full device drains. Must be at least 1.
    pub queue_barrier: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { mode: ExecutionMode::Pipelined, queue_barrier: 32 }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub inputs: usize,
    pub work_items: usize,
    /// Intermediate drains (the final drain is not counted).
    pub barriers: usize,
    /// From the first submission to the end of readback.
    pub elapsed: Duration,
}

impl RunStats {
    pub fn mean_per_input(&self) -> Duration {
        if self.inputs == 0 {
            Duration::ZERO
        } else {
            self.elapsed / self.inputs as u32
        }
    }
}

/// Outputs and completion tokens of one run.
#[derive(Debug, Clone)]
pub struct RunOutput<T> {
    /// `n · out_size` floats, output `i` at offset `i · out_size`.
    pub outputs: Vec<f32>,
    /// Every issued work item with its token, in `(sequence, stage)` order.
    pub tokens: Vec<(WorkItem, T)>,
    pub stats: RunStats,
}

// ---------------------------------------------------------------------------
// PipelineScheduler
// ---------------------------------------------------------------------------

pub struct PipelineScheduler {
    config: SchedulerConfig,
}

impl PipelineScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        if config.queue_barrier == 0 {
            return Err(ConfigError::ZeroBarrier);
        }
        Ok(PipelineScheduler { config })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run `n` inputs (`inputs.len() == n · in_size`) through `pipeline`.
    pub fn run<D: Device>(
        &self,
        device: &mut D,
        pipeline: &mut Pipeline<D>,
        inputs: &[f32],
        n: usize,
    ) -> Result<RunOutput<D::Token>> {
        let mode = self.config.mode;
        match (mode, device.queue_order()) {
            (ExecutionMode::Batched, QueueOrder::OutOfOrder) => {
                return Err(ConfigError::BatchedOnOutOfOrderQueue.into());
            }
            (ExecutionMode::Pipelined, QueueOrder::InOrder) => {
                warn!(
                    "pipelined mode on an in-order queue ({}): stages will not overlap",
                    device.describe()
                );
            }
            _ => {}
        }

        pipeline.write_inputs(device, inputs, n)?;

        let start = Instant::now();
        let issued = match mode {
            ExecutionMode::Batched => self.issue_batched(device, pipeline, n),
            ExecutionMode::Pipelined => self.issue_pipelined(device, pipeline, n),
        };
        let (mut tokens, barriers) = match issued {
            Ok(done) => done,
            Err(e) => {
                if let Err(drain_err) = device.drain() {
                    warn!("drain after failed run also failed: {drain_err}");
                }
                return Err(e);
            }
        };

        device.drain()?;
        let outputs = pipeline.read_outputs(device, n)?;
        let elapsed = start.elapsed();

        tokens.sort_by_key(|(item, _)| *item);
        let stats = RunStats { inputs: n, work_items: tokens.len(), barriers, elapsed };
        info!(
            "{mode}: {} inputs, {} work items, {} barriers, {:?} per input",
            stats.inputs,
            stats.work_items,
            stats.barriers,
            stats.mean_per_input()
        );
        Ok(RunOutput { outputs, tokens, stats })
    }

    /// Drain after every `queue_barrier`-th input, except after the last.
    fn barrier<D: Device>(
        &self,
        device: &mut D,
        sequence: usize,
        n: usize,
        count: &mut usize,
    ) -> Result<()> {
        let issued = sequence + 1;
        if issued % self.config.queue_barrier == 0 && issued < n {
            debug!("barrier after {issued} inputs");
            device.drain()?;
            *count += 1;
        }
        Ok(())
    }

    fn issue_batched<D: Device>(
        &self,
        device: &mut D,
        pipeline: &Pipeline<D>,
        n: usize,
    ) -> Result<(Vec<(WorkItem, D::Token)>, usize)> {
        let mut tokens = Vec::with_capacity(n * pipeline.len());
        let mut barriers = 0;
        for sequence in 0..n {
            let mut previous: Option<D::Token> = None;
            for stage in 0..pipeline.len() {
                let item = WorkItem::new(stage, sequence);
                let token = pipeline.execute(device, item, previous.as_slice())?;
                tokens.push((item, token.clone()));
                previous = Some(token);
            }
            self.barrier(device, sequence, n, &mut barriers)?;
        }
        Ok((tokens, barriers))
    }

    fn issue_pipelined<D: Device>(
        &self,
        device: &mut D,
        pipeline: &Pipeline<D>,
        n: usize,
    ) -> Result<(Vec<(WorkItem, D::Token)>, usize)> {
        let mut pool = DependencyTokenPool::new(pipeline.len());
        let mut tokens = Vec::with_capacity(n * pipeline.len());
        let mut wait: Vec<D::Token> = Vec::with_capacity(2);
        let mut barriers = 0;
        for sequence in 0..n {
            for stage in 0..pipeline.len() {
                let item = WorkItem::new(stage, sequence);
                wait.clear();
                wait.extend(pool.resolve(item)?);
                let token = pipeline.execute(device, item, &wait)?;
                pool.push(item, token.clone())?;
                tokens.push((item, token));
            }
            self.barrier(device, sequence, n, &mut barriers)?;
        }
        Ok((tokens, barriers))
    }
}

/// Run in batched mode with a single barrier at the end.
pub fn run_batched<D: Device>(
    device: &mut D,
    pipeline: &mut Pipeline<D>,
    inputs: &[f32],
    n: usize,
) -> Result<RunOutput<D::Token>> {
    let config = SchedulerConfig { mode: ExecutionMode::Batched, queue_barrier: n.max(1) };
    PipelineScheduler::new(config)?.run(device, pipeline, inputs, n)
}

/// Run in pipelined mode, draining every `queue_barrier` inputs.
pub fn run_pipelined<D: Device>(
    device: &mut D,
    pipeline: &mut Pipeline<D>,
    inputs: &[f32],
    n: usize,
    queue_barrier: usize,
) -> Result<RunOutput<D::Token>> {
    let config = SchedulerConfig { mode: ExecutionMode::Pipelined, queue_barrier };
    PipelineScheduler::new(config)?.run(device, pipeline, inputs, n)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
