//! MusicGen Studio: browser front end for text-to-music generation.
//!
//! Serves the generator page and its JSON API. The model is downloaded and
//! loaded on the first generate request (or at startup with `--preload`) and
//! stays resident for the life of the process.
//!
//! Configuration comes from `config/default.*`, `config/local.*`,
//! `MUSICGEN__*` environment variables (a `.env` file is honoured), and the
//! flags below, in increasing priority.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use musicgen_studio::{
    config::ModelVariant,
    logging::init_logging,
    manager::{pipeline_loader, GenerationManager},
    settings::{AppConfig, LogFormat},
    web::{create_router, AppState},
};

#[derive(Parser, Debug)]
#[command(
    name = "musicgen-studio",
    version,
    about = "Browser front end for MusicGen text-to-music generation"
)]
struct Args {
    /// Address to bind.
    #[arg(long, env = "MUSICGEN_HOST")]
    host: Option<String>,

    /// Port to listen on.
    #[arg(long, short = 'p', env = "MUSICGEN_PORT")]
    port: Option<u16>,

    /// Checkpoint size: small, medium or large (or a facebook/musicgen-* repo id).
    #[arg(long, short = 'm')]
    model: Option<ModelVariant>,

    /// Load weights from a local directory instead of the HuggingFace hub.
    #[arg(long)]
    local_dir: Option<PathBuf>,

    /// Force CPU even when an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Load the model at startup instead of on the first request.
    #[arg(long)]
    preload: bool,

    /// Seconds of audio per request (1–30).
    #[arg(long, short = 'd')]
    duration: Option<f64>,

    /// Fixed random seed for every request.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(variant) = self.model {
            config.model.variant = variant;
        }
        if self.local_dir.is_some() {
            config.model.local_dir = self.local_dir;
        }
        config.model.force_cpu |= self.cpu;
        config.model.preload |= self.preload;
        if let Some(duration) = self.duration {
            config.generation.duration_s = duration;
        }
        if self.seed.is_some() {
            config.generation.seed = self.seed;
        }
        if self.json_logs {
            config.logging.format = LogFormat::Json;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = AppConfig::load().context("failed to load configuration")?;
    args.apply(&mut config);
    init_logging(&config.logging);

    config
        .generation
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid generation settings: {e}"))?;

    let manager_config = config.manager_config();
    let loader = pipeline_loader(config.model.source(), manager_config.dtype);
    let manager = GenerationManager::start(manager_config, loader);

    if config.model.preload {
        let manager = manager.clone();
        tokio::spawn(async move {
            match manager.preload().await {
                Ok(()) => tracing::info!("model preloaded"),
                Err(error) => tracing::error!(%error, "model preload failed, will retry on first request"),
            }
        });
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        %addr,
        model = %config.model.source().repo_id(),
        duration_s = config.generation.duration_s,
        "MusicGen Studio listening"
    );

    axum::serve(listener, create_router(AppState::new(manager)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for ctrl-c");
    }
}
