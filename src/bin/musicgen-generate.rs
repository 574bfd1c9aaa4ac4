//! Generate music from text prompts and save it as WAV files.
//!
//! Writes `generated_music_{i}.wav` into `--output-dir` for the i-th prompt and
//! prints one JSON line per file:
//!
//! ```json
//! {"path":"./generated_music_0.wav","prompt":"...","duration_s":8.0,"sample_rate":32000,"channels":1}
//! ```
//!
//! On failure the error is printed together with version and device
//! diagnostics, and the exit code is non-zero.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use musicgen_studio::{
    audio::{peak_normalize, write_wav},
    config::ModelVariant,
    logging::init_cli_logging,
    manager::preferred_device,
    pipeline::{GenerationParams, ModelSource, MusicGenerator, MusicgenPipeline},
    prompt::{Prompt, DEFAULT_CLI_PROMPTS},
};

#[derive(Parser, Debug)]
#[command(
    name = "musicgen-generate",
    version,
    about = "Generate music with MusicGen and save it as WAV",
    long_about = "Generate one clip per --prompt and save them as generated_music_{i}.wav.\n\
                  Downloads the model weights from HuggingFace on first run."
)]
struct Args {
    /// Text description of the music. Repeat for several clips.
    /// Defaults to two Afrobeats prompts.
    #[arg(long, short = 'p')]
    prompt: Vec<String>,

    /// Duration in seconds (1–30).
    #[arg(long, short = 'd', default_value_t = 8.0)]
    duration: f64,

    /// Directory for the generated files.
    #[arg(long, short = 'o', default_value = ".")]
    output_dir: PathBuf,

    /// Checkpoint size: small, medium or large (or a facebook/musicgen-* repo id).
    #[arg(long, short = 'm', default_value = "small")]
    model: ModelVariant,

    /// Load weights from a local directory instead of the HuggingFace hub.
    #[arg(long)]
    local_dir: Option<PathBuf>,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Top-k sampling cutoff (0 = full distribution).
    #[arg(long, default_value_t = 250)]
    top_k: usize,

    /// Sampling temperature (0 = greedy).
    #[arg(long, default_value_t = 1.0)]
    temperature: f64,

    /// Classifier-free guidance scale (1 = off).
    #[arg(long, default_value_t = 3.0)]
    guidance_scale: f64,

    /// Force CPU even when an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Peak-normalize each clip before saving.
    #[arg(long)]
    normalize: bool,
}

fn main() -> ExitCode {
    init_cli_logging();
    let args = Args::parse();
    let force_cpu = args.cpu;

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error occurred: {error:#}");
            eprintln!("musicgen-studio version: {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Platform: {}-{}", std::env::consts::OS, std::env::consts::ARCH);
            let device = if force_cpu {
                candle_core::Device::Cpu
            } else {
                preferred_device(0)
            };
            eprintln!("Device: {device:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let prompts = if args.prompt.is_empty() {
        DEFAULT_CLI_PROMPTS.iter().map(|p| p.to_string()).collect()
    } else {
        args.prompt
    };
    let prompts = prompts
        .iter()
        .map(|text| Prompt::parse(text))
        .collect::<Result<Vec<_>, _>>()?;

    let params = GenerationParams {
        duration_s: args.duration,
        top_k: args.top_k,
        temperature: args.temperature,
        guidance_scale: args.guidance_scale,
        seed: args.seed,
    };
    params.validate()?;

    std::fs::create_dir_all(&args.output_dir)?;

    let device = if args.cpu {
        candle_core::Device::Cpu
    } else {
        preferred_device(0)
    };
    let source = ModelSource {
        variant: args.model,
        local_dir: args.local_dir,
        ..ModelSource::default()
    };

    tracing::info!("Using device: {:?}", device);
    tracing::info!("Loading {}...", source.repo_id());
    let mut pipeline = MusicgenPipeline::load(&source, &device, candle_core::DType::F32)
        .map_err(|e| anyhow::anyhow!("failed to load model: {e}"))?;
    pipeline.set_generation_params(params)?;

    tracing::info!(
        "Generating {} clip(s) of {:.1}s...",
        prompts.len(),
        args.duration
    );
    let clips = pipeline
        .generate(&prompts)
        .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;

    for (i, (prompt, mut audio)) in prompts.iter().zip(clips).enumerate() {
        if args.normalize {
            peak_normalize(&mut audio.samples);
        }
        let path = args.output_dir.join(format!("generated_music_{i}.wav"));
        write_wav(&path, &audio.samples, audio.sample_rate, audio.channels)
            .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;

        tracing::info!("Saved generated music {i} as '{}'", path.display());
        println!(
            "{}",
            serde_json::json!({
                "path": path.display().to_string(),
                "prompt": prompt.as_str(),
                "duration_s": audio.duration_s(),
                "sample_rate": audio.sample_rate,
                "channels": audio.channels,
            })
        );
    }

    Ok(())
}
