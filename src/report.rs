// report.rs — Timing and profile summary of scheduler runs.
//
// A `RunReport` collects, for one network on one backend:
//   - the single-input latency (mean over `LATENCY_RUNS` one-input runs),
//   - the CPU cross-check summary of the functional test,
//   - one `ModeReport` per timed run (batched and/or pipelined).
//
// When the backend records per-token timestamps (`Device::profile`), each
// `ModeReport` carries one `TokenRecord` per work item, in (sequence, stage)
// order. Backends without timestamps leave the list empty.
//
// The whole report serialises to pretty JSON for the CLI's `--report` flag.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::Serialize;

use crate::check::CheckSummary;
use crate::device::{Device, QueueOrder};
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::scheduler::{ExecutionMode, PipelineScheduler, RunOutput, SchedulerConfig};

/// One-input runs averaged by `single_input_latency` in the CLI.
pub const LATENCY_RUNS: usize = 10;

/// Timestamps of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenRecord {
    pub sequence: usize,
    pub stage: usize,
    pub queued_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
}

/// Summary of one timed run.
#[derive(Debug, Clone, Serialize)]
pub struct ModeReport {
    pub mode: ExecutionMode,
    pub inputs: usize,
    pub queue_barrier: usize,
    pub barriers: usize,
    pub elapsed_ns: u64,
    pub mean_ns: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<TokenRecord>,
}

impl ModeReport {
    pub fn from_run<D: Device>(
        device: &D,
        mode: ExecutionMode,
        queue_barrier: usize,
        run: &RunOutput<D::Token>,
    ) -> Self {
        let tokens = run
            .tokens
            .iter()
            .filter_map(|(item, token)| {
                device.profile(token).map(|p| TokenRecord {
                    sequence: item.sequence,
                    stage: item.stage,
                    queued_ns: p.queued_ns,
                    start_ns: p.start_ns,
                    end_ns: p.end_ns,
                })
            })
            .collect();
        ModeReport {
            mode,
            inputs: run.stats.inputs,
            queue_barrier,
            barriers: run.stats.barriers,
            elapsed_ns: as_ns(run.stats.elapsed),
            mean_ns: as_ns(run.stats.mean_per_input()),
            tokens,
        }
    }
}

/// Everything the CLI measured for one network.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub network: String,
    pub backend: String,
    pub queue_order: QueueOrder,
    pub stages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_input_ns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckSummary>,
    pub runs: Vec<ModeReport>,
}

impl RunReport {
    pub fn new(
        network: impl Into<String>,
        backend: impl Into<String>,
        queue_order: QueueOrder,
        stages: usize,
    ) -> Self {
        RunReport {
            network: network.into(),
            backend: backend.into(),
            queue_order,
            stages,
            single_input_ns: None,
            check: None,
            runs: Vec::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        writeln!(out)?;
        out.flush()
    }
}

/// Mean wall time of `runs` single-input runs of `input`.
///
/// Uses batched issuance on in-order queues and pipelined issuance
/// otherwise, so the measurement is valid on every backend.
pub fn single_input_latency<D: Device>(
    device: &mut D,
    pipeline: &mut Pipeline<D>,
    input: &[f32],
    runs: usize,
) -> Result<Duration> {
    let mode = match device.queue_order() {
        QueueOrder::InOrder => ExecutionMode::Batched,
        QueueOrder::OutOfOrder => ExecutionMode::Pipelined,
    };
    let scheduler = PipelineScheduler::new(SchedulerConfig { mode, queue_barrier: 1 })?;
    let mut total = Duration::ZERO;
    for run in 0..runs {
        let out = scheduler.run(device, pipeline, input, 1)?;
        debug!("single input run {run}: {:?}", out.stats.elapsed);
        total += out.stats.elapsed;
    }
    Ok(if runs == 0 { Duration::ZERO } else { total / runs as u32 })
}

fn as_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
