// wavefront: software-pipelined CNN inference over asynchronous compute queues
//
// A fixed-topology network (LeNet-5 style) is a chain of stages. N inputs
// are pushed through it as N·S work items on a single device queue. In
// pipelined mode each work item waits only on the two earlier items it
// actually conflicts with, resolved from a token pool whose size depends on
// the number of stages, never on N.
//
// Layout (leaf first):
//   shape, stage        volumes and per-layer numerics (CPU reference)
//   device              backend trait; host (CPU queue) and gpu (wgpu)
//   pipeline            stages bound to a device with their buffers
//   token_pool          bounded wavefront dependency resolution
//   scheduler           batched / pipelined issuance with barriers
//   check, report       CPU cross-check and run reports
//   config              JSON network files and the LeNet-5 preset
//   rng                 seeded xorshift for weights, inputs and host picks

pub mod shape;
pub mod error;
pub mod stage;
pub mod device;
pub mod host;
pub mod token_pool;
pub mod pipeline;
pub mod scheduler;
pub mod check;
pub mod config;
pub mod report;
pub mod gpu;
pub mod rng;

pub use check::{cross_check, CheckSummary, CorrectnessMismatch, TOLERANCE};
pub use config::NetworkConfig;
pub use device::{Device, QueueOrder};
pub use error::{ConfigError, DeviceError, Error, Result};
pub use host::HostDevice;
pub use pipeline::Pipeline;
pub use rng::SimpleRng;
pub use scheduler::{run_batched, run_pipelined, ExecutionMode, PipelineScheduler, SchedulerConfig};
pub use shape::Shape;
pub use stage::{PoolMode, Stage, StageKind};
pub use token_pool::{DependencyTokenPool, WorkItem};
