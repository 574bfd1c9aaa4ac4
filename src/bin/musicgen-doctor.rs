//! Check that everything needed to generate music is available.
//!
//! Probes the compute device, fetches (or finds) the tokenizer and weights,
//! and loads the model unless `--skip-model` is given. Exit code 0 when no
//! check failed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use musicgen_studio::{
    config::ModelVariant,
    doctor::{run_checks, DoctorOptions},
    logging::init_cli_logging,
    pipeline::ModelSource,
};

#[derive(Parser, Debug)]
#[command(
    name = "musicgen-doctor",
    version,
    about = "Check that MusicGen can run on this machine"
)]
struct Args {
    /// Checkpoint size: small, medium or large.
    #[arg(long, short = 'm', default_value = "small")]
    model: ModelVariant,

    /// Check a local weights directory instead of the HuggingFace hub.
    #[arg(long)]
    local_dir: Option<PathBuf>,

    /// Probe CPU only.
    #[arg(long)]
    cpu: bool,

    /// CUDA device ordinal.
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Skip loading the model (the slowest and most memory-hungry check).
    #[arg(long)]
    skip_model: bool,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    init_cli_logging();
    let args = Args::parse();

    let options = DoctorOptions {
        source: ModelSource {
            variant: args.model,
            local_dir: args.local_dir,
            ..ModelSource::default()
        },
        force_cpu: args.cpu,
        cuda_device: args.device,
        skip_model: args.skip_model,
    };

    if !args.json {
        println!("🚀 MusicGen deployment check");
        println!("{}", "=".repeat(40));
        println!("musicgen-studio version: {}", env!("CARGO_PKG_VERSION"));
        println!("Platform: {}-{}", std::env::consts::OS, std::env::consts::ARCH);
        println!("Model: {}", options.source.repo_id());
        println!();
    }

    let report = run_checks(&options);

    if args.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        for check in &report.checks {
            println!("{check}");
        }
        println!();
        println!("{}", report.summary());
    }

    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
