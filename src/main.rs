//! CLI Entry Point for trace-daq
//!
//! Provides a command-line interface for:
//! - Running a capture against the simulated bench (`simulate`)
//! - Aligning the artifacts of a finished capture run (`align`)
//! - Checking that the configured SCPI recorder connects and arms (`check-recorder`)
//!
//! # Usage
//!
//! Capture 200 traces on the mock bench:
//! ```bash
//! trace-daq simulate --config config/trace_daq.toml --traces 200 --summary run.json
//! ```
//!
//! Align them:
//! ```bash
//! trace-daq align --input data --output data/aligned.arrow
//! ```
//!
//! Verify the bench recorder before a hardware run:
//! ```bash
//! trace-daq check-recorder --config config/trace_daq.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use trace_daq::acquisition::{AcquisitionOrchestrator, InstrumentController};
use trace_daq::alignment::AlignmentEngine;
use trace_daq::config::RunConfig;
use trace_daq::hardware::mock::{MockBench, MockSignal};
use trace_daq::hardware::scpi_recorder::ScpiRecorder;
use trace_daq::storage::{read_capture_run, write_aligned_artifact};
use trace_daq::tracing_setup::{self, OutputFormat, TracingConfig};

const DEFAULT_CONFIG: &str = "config/trace_daq.toml";

#[derive(Parser)]
#[command(name = "trace-daq")]
#[command(about = "Synchronised trace capture and offline alignment", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture traces from the simulated recorder and device
    Simulate {
        /// Run configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the number of traces
        #[arg(long)]
        traces: Option<usize>,

        /// Write the run summary as JSON
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Align the artifacts of a capture run
    Align {
        /// Directory holding the capture artifacts
        #[arg(long)]
        input: PathBuf,

        /// Aligned artifact to write
        #[arg(long)]
        output: PathBuf,

        /// Run configuration (TOML) supplying alignment parameters
        #[arg(long)]
        config: Option<PathBuf>,

        /// Artifact file prefix (defaults to the configured one)
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Connect to the configured SCPI recorder, apply its settings and arm once
    CheckRecorder {
        /// Run configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            traces,
            summary,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(n) = traces {
                cfg.acquisition.n_traces = n;
            }
            init_tracing(&cfg, cli.log_format)?;
            simulate(cfg, summary).await
        }
        Commands::Align {
            input,
            output,
            config,
            prefix,
        } => {
            let cfg = load_config(config.as_deref())?;
            init_tracing(&cfg, cli.log_format)?;
            align(&cfg, &input, &output, prefix)
        }
        Commands::CheckRecorder { config } => {
            let cfg = load_config(config.as_deref())?;
            init_tracing(&cfg, cli.log_format)?;
            check_recorder(&cfg).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG));
    RunConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

fn init_tracing(cfg: &RunConfig, format: OutputFormat) -> Result<()> {
    let tracing_cfg = TracingConfig::from_run_config(cfg)?.with_format(format);
    tracing_setup::init(tracing_cfg)?;
    Ok(())
}

async fn simulate(cfg: RunConfig, summary_path: Option<PathBuf>) -> Result<()> {
    let signal = MockSignal {
        points: cfg.recorder.points_per_trace,
        event_index: cfg.recorder.points_per_trace / 2,
        ..Default::default()
    };
    let bench = MockBench::new(signal);
    let recorder = bench.recorder();
    let device = bench.device(cfg.device.registers);

    tracing::info!(
        traces = cfg.acquisition.n_traces,
        output_dir = %cfg.storage.output_dir.display(),
        "Starting simulated capture"
    );
    let orchestrator = AcquisitionOrchestrator::new(recorder, device, cfg)?;
    let summary = orchestrator.run().await?;

    if let Some(path) = summary_path {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing summary to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Run summary written");
    }
    Ok(())
}

fn align(cfg: &RunConfig, input: &Path, output: &Path, prefix: Option<String>) -> Result<()> {
    let prefix = prefix.unwrap_or_else(|| cfg.storage.file_prefix.clone());
    let traces = read_capture_run(input, &prefix)
        .with_context(|| format!("reading capture artifacts from {}", input.display()))?;
    tracing::info!(traces = traces.len(), input = %input.display(), "Loaded capture run");

    let engine = AlignmentEngine::new(cfg.alignment.clone());
    let dataset = engine.process(traces)?;
    write_aligned_artifact(output, &dataset)?;

    tracing::info!(
        kept = dataset.traces.len(),
        dropped = dataset.dropped,
        start = dataset.window.start,
        end = dataset.window.end,
        output = %output.display(),
        "Aligned dataset written"
    );
    Ok(())
}

async fn check_recorder(cfg: &RunConfig) -> Result<()> {
    let resource = &cfg.recorder.resource;
    let recorder = ScpiRecorder::open_tcp(resource, cfg.recorder.time_per_div_s)
        .await
        .with_context(|| format!("connecting to recorder at {resource}"))?;
    let mut controller = InstrumentController::new(recorder, cfg.recorder.clone());

    let armed = match controller.setup(cfg.acquisition.segment_count).await {
        Ok(()) => Ok(controller.arm().await),
        Err(e) => Err(e),
    };
    if let Err(e) = controller.disconnect().await {
        tracing::warn!(error = %e, "Recorder teardown failed");
    }

    if !armed? {
        anyhow::bail!("recorder at {resource} never reported an armed state");
    }
    tracing::info!(resource = %resource, "Recorder armed");
    Ok(())
}
