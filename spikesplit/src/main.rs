use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use log::info;

use spikesplit::config::RunConfig;
use spikesplit::io::{read_i64_array, write_i64_array, RunReport};
use spikesplit::labels::{n_triaged, unique_labels};
use spikesplit::pipeline::{run_all, run_merge, run_split};
use spikesplit::split::cache::{DatasetHandle, RawHandle};
use spikesplit::Result;

#[derive(Parser)]
#[command(name = "spikesplit")]
#[command(about = "Split and merge refinement of spike sorting labels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Common {
    /// Feature store directory
    #[arg(long)]
    store: PathBuf,

    /// Raw recording, little-endian f32, samples x channels
    #[arg(long)]
    raw: PathBuf,

    /// Input labels, little-endian i64
    #[arg(long)]
    labels: PathBuf,

    /// Output directory
    #[arg(long)]
    out: PathBuf,

    /// JSON run configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads for the split passes (overrides the config)
    #[arg(long)]
    workers: Option<usize>,

    /// Seed for all subsampling (overrides the config)
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured split passes
    Split(Common),
    /// Merge units with matching templates
    Merge {
        #[command(flatten)]
        common: Common,
        /// Spike times to build templates from, little-endian i64
        #[arg(long)]
        times: Option<PathBuf>,
    },
    /// Split, then merge
    Run(Common),
}

impl Common {
    fn load_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load_json(path)?,
            None => RunConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.split.n_workers = workers;
        }
        if let Some(seed) = self.seed {
            config.split.seed = seed;
            config.merge.oracle.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }

    fn handles(&self) -> (DatasetHandle, RawHandle) {
        (DatasetHandle::OnDisk(self.store.clone()), RawHandle::OnDisk(self.raw.clone()))
    }
}

fn write_outputs(out: &Path, labels: &[i64], times: Option<&[i64]>, report: &RunReport) -> Result<()> {
    std::fs::create_dir_all(out)?;
    write_i64_array(&out.join("labels.i64"), labels)?;
    if let Some(times) = times {
        write_i64_array(&out.join("aligned_times.i64"), times)?;
    }
    report.write_json(&out.join("report.json"))?;
    info!("wrote results to {}", out.display());
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Split(common) => {
            let config = common.load_config()?;
            let labels = read_i64_array(&common.labels)?;
            let (dataset, raw) = common.handles();
            let split = run_split(&labels, dataset, raw, &config.split)?;
            let report = RunReport {
                n_spikes: labels.len(),
                units_in: unique_labels(&labels).len(),
                units_after_split: Some(unique_labels(&split.labels).len()),
                triaged: n_triaged(&split.labels),
                split_steps: split.reports,
                ..Default::default()
            };
            write_outputs(&common.out, &split.labels, None, &report)
        }
        Commands::Merge { common, times } => {
            let config = common.load_config()?;
            let labels = read_i64_array(&common.labels)?;
            let times = times.as_deref().map(read_i64_array).transpose()?;
            let (dataset, raw) = common.handles();
            let merged = run_merge(&labels, times.as_deref(), dataset, raw, &config.merge, config.split.seed)?;
            let report = RunReport {
                n_spikes: labels.len(),
                units_in: unique_labels(&labels).len(),
                units_after_merge: Some(unique_labels(&merged.labels).len()),
                triaged: n_triaged(&merged.labels),
                merges: merged.events.clone(),
                ..Default::default()
            };
            write_outputs(&common.out, &merged.labels, Some(&merged.aligned_times), &report)
        }
        Commands::Run(common) => {
            let config = common.load_config()?;
            let labels = read_i64_array(&common.labels)?;
            let (dataset, raw) = common.handles();
            let (merged, report) = run_all(&labels, dataset, raw, &config)?;
            write_outputs(&common.out, &merged.labels, Some(&merged.aligned_times), &report)
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
