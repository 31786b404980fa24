// wavefront — run a network through the scheduler and report timing.
//
//   RUST_LOG=debug cargo run --release -- --backend gpu --inputs 1000
//   cargo run --release -- --config net.json --backend host --out-of-order
//
// Without --config the seeded LeNet-5 preset is used. Every run is checked
// against the CPU reference before its timing is reported; a mismatch is
// fatal.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{error, info};

use wavefront::device::Device;
use wavefront::gpu::GpuBackend;
use wavefront::host::{HostConfig, HostDevice};
use wavefront::report::{single_input_latency, ModeReport, RunReport, LATENCY_RUNS};
use wavefront::{
    cross_check, ExecutionMode, NetworkConfig, Pipeline, PipelineScheduler, QueueOrder,
    SchedulerConfig, SimpleRng, TOLERANCE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// CPU queue executing the reference kernels
    Host,
    /// wgpu compute (Vulkan)
    Gpu,
}

#[derive(Parser)]
#[command(name = "wavefront")]
#[command(about = "Pipelined CNN inference scheduling over a compute queue", long_about = None)]
struct Cli {
    /// Network description (JSON); defaults to the LeNet-5 preset
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Backend::Host)]
    backend: Backend,

    /// Host backend only: run ready work in random order
    #[arg(long)]
    out_of_order: bool,

    /// Number of inputs per timed run
    #[arg(short = 'n', long, default_value = "1000")]
    inputs: usize,

    /// Inputs between queue drains (overrides the network file)
    #[arg(long)]
    barrier: Option<usize>,

    /// Seed for the LeNet-5 parameters, the inputs and the host queue
    #[arg(short, long, default_value = "1")]
    seed: u64,

    /// Write a JSON report to FILE
    #[arg(short, long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Write the network description to FILE and exit
    #[arg(long, value_name = "FILE")]
    dump_config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();

    let mut network = match &cli.config {
        Some(path) => {
            info!("loading network from {}", path.display());
            NetworkConfig::load(path)?
        }
        None => NetworkConfig::lenet5(cli.seed),
    };
    if let Some(barrier) = cli.barrier {
        network.queue_barrier = barrier;
    }

    if let Some(path) = &cli.dump_config {
        std::fs::write(path, network.to_json_string()?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("wrote {} to {}", network.name, path.display());
        return Ok(());
    }

    let report = match cli.backend {
        Backend::Host => {
            let host = if cli.out_of_order {
                HostConfig::out_of_order(cli.seed)
            } else {
                HostConfig { seed: cli.seed, ..HostConfig::default() }
            };
            run(HostDevice::new(host), &network, &cli)?
        }
        Backend::Gpu => run(GpuBackend::open()?, &network, &cli)?,
    };

    println!("{}  on {}", report.network, report.backend);
    if let Some(ns) = report.single_input_ns {
        println!("  single input     {:>10.3} ms", ns as f64 / 1e6);
    }
    for mode in &report.runs {
        println!(
            "  {:<9} x{:<5} {:>10.3} ms/input  ({} barriers)",
            mode.mode.to_string(),
            mode.inputs,
            mode.mean_ns as f64 / 1e6,
            mode.barriers
        );
    }

    if let Some(path) = &cli.report {
        report.write(path).with_context(|| format!("writing {}", path.display()))?;
        info!("report written to {}", path.display());
    }
    Ok(())
}

fn run<D: Device>(mut device: D, network: &NetworkConfig, cli: &Cli) -> Result<RunReport> {
    let mut pipeline = Pipeline::from_config(&mut device, network)?;
    let n = cli.inputs;
    if n == 0 {
        bail!("--inputs must be at least 1");
    }
    let in_size = pipeline.in_size();
    let inputs = SimpleRng::new(cli.seed).uniform(in_size * n, 0.0, 1.0);
    let expected = pipeline.forward_cpu_batch(&inputs, n)?;

    let order = device.queue_order();
    let mut report = RunReport::new(&network.name, device.describe(), order, pipeline.len());

    let latency =
        single_input_latency(&mut device, &mut pipeline, &inputs[..in_size], LATENCY_RUNS)?;
    report.single_input_ns = Some(u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX));

    let mut modes = vec![(ExecutionMode::Pipelined, network.queue_barrier)];
    if order == QueueOrder::InOrder {
        modes.insert(0, (ExecutionMode::Batched, n.max(1)));
    }

    for (mode, queue_barrier) in modes {
        let scheduler = PipelineScheduler::new(SchedulerConfig { mode, queue_barrier })?;
        let out = scheduler.run(&mut device, &mut pipeline, &inputs, n)?;
        match cross_check(&expected, &out.outputs, TOLERANCE) {
            Ok(summary) => {
                info!(
                    "{mode}: {} outputs match the CPU (max diff {:e})",
                    summary.compared, summary.max_abs_diff
                );
                report.check = Some(summary);
            }
            Err(mismatch) => {
                error!("{mode}: {mismatch}");
                bail!("{mode} run disagrees with the CPU reference: {mismatch}");
            }
        }
        report.runs.push(ModeReport::from_run(&device, mode, queue_barrier, &out));
    }
    Ok(report)
}

