// error.rs — Error taxonomy.
//
//   ConfigError   — bad topology or parameters, detected before any run.
//   Error::SizeMismatch — caller-supplied buffers of the wrong length,
//                   detected at run entry.
//   DeviceError   — submission / synchronisation / readback failure from a
//                   backend. Fatal for the run; the scheduler drains the
//                   queue before handing it back.
//   PoolError     — a dependency token that should have been live was not.
//                   Indicates a scheduler bug, never a user error.
//
// Numeric disagreement between the CPU reference and a device lives in
// `check::CorrectnessMismatch`; it is a diagnostic, not a runtime fault.

use std::path::PathBuf;

use crate::gpu::device::GpuError;
use crate::shape::Shape;
use crate::token_pool::PoolError;

/// Invalid network topology or stage parameters.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("pipeline must contain at least one stage")]
    EmptyPipeline,

    #[error("stage {index} (`{name}`) produces {output} but the next stage expects {next_input}")]
    ShapeMismatch {
        index: usize,
        name: String,
        output: Shape,
        next_input: Shape,
    },

    #[error("stage `{name}`: expected {expected} {what}, got {actual}")]
    ParameterCount {
        name: String,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("stage `{name}`: {reason}")]
    InvalidStage { name: String, reason: String },

    #[error("queue barrier interval must be at least 1")]
    ZeroBarrier,

    #[error("batched mode requires an in-order device queue")]
    BatchedOnOutOfOrderQueue,

    #[error("cannot read network config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed network config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure reported by a device backend.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("kernel for stage `{stage}` failed to build: {message}")]
    KernelBuild { stage: String, message: String },

    #[error("wait list references token {0}, which was never issued")]
    UnknownToken(u64),

    #[error("{pending} queued operations can never become ready")]
    Deadlock { pending: usize },

    #[error("buffer access [{offset}, {offset}+{len}) exceeds capacity {capacity}")]
    OutOfRange {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("dispatch for stage `{stage}` binds {actual} {what} elements, kernel needs {expected}")]
    BindingSize {
        stage: String,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("readback failed: {0}")]
    Readback(String),

    #[error("injected fault on submission {0}")]
    InjectedFault(usize),
}

/// Top-level error returned by pipeline construction and scheduling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{what}: expected {expected} floats, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Dependency(#[from] PoolError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
