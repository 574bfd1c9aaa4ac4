//! Generation manager: the process-wide cached model handle.
//!
//! The manager owns one [`MusicGenerator`] on a dedicated blocking thread.
//! The model is loaded on the first request (or on [`GenerationManager::preload`])
//! and kept for the life of the process. Requests are processed sequentially.
//! On an accelerator OOM the manager reloads the model on CPU and retries.
//!
//! # Example
//!
//! ```no_run
//! use musicgen_studio::manager::{GenerationManager, ManagerConfig, pipeline_loader};
//! use musicgen_studio::pipeline::ModelSource;
//! use musicgen_studio::prompt::Prompt;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ManagerConfig::default();
//!     let loader = pipeline_loader(ModelSource::default(), config.dtype);
//!     let manager = GenerationManager::start(config, loader);
//!     let prompt = Prompt::parse("smooth jazz with saxophone").unwrap();
//!     let audio = manager.generate(prompt).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use candle_core::{DType, Device};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::pipeline::{GeneratedAudio, GenerationParams, ModelSource, MusicGenerator, MusicgenPipeline};
use crate::prompt::Prompt;
use crate::{Error, Result};

/// Builds a generator on the given device.
pub type GeneratorLoader = Arc<dyn Fn(&Device) -> Result<Box<dyn MusicGenerator>> + Send + Sync>;

/// Loader for the real MusicGen checkpoint.
pub fn pipeline_loader(source: ModelSource, dtype: DType) -> GeneratorLoader {
    Arc::new(move |device: &Device| {
        let pipeline = MusicgenPipeline::load(&source, device, dtype)?;
        Ok(Box::new(pipeline) as Box<dyn MusicGenerator>)
    })
}

/// Configuration for the generation manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// CUDA device ordinal (0 = first GPU). Ignored when CUDA is unavailable.
    pub cuda_device: usize,

    /// Skip accelerator detection and load on CPU.
    pub force_cpu: bool,

    /// Data type for model weights and activations.
    pub dtype: DType,

    /// Generation parameters applied once the model is loaded.
    pub params: GenerationParams,

    /// Requests that may wait while one is being generated.
    pub queue_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cuda_device: 0,
            force_cpu: false,
            dtype: DType::F32,
            params: GenerationParams::default(),
            queue_capacity: 64,
        }
    }
}

impl ManagerConfig {
    pub fn device(&self) -> Device {
        if self.force_cpu {
            Device::Cpu
        } else {
            preferred_device(self.cuda_device)
        }
    }
}

/// Lifecycle of the cached model handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelStatus {
    NotLoaded,
    Loading,
    Ready { device: String },
    /// The last load attempt failed; the next request tries again.
    Failed { error: String },
}

impl ModelStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

enum Command {
    Preload {
        reply: oneshot::Sender<Result<()>>,
    },
    Generate {
        prompts: Vec<Prompt>,
        reply: oneshot::Sender<Result<Vec<GeneratedAudio>>>,
    },
}

/// Handle for submitting generation requests to a running manager.
#[derive(Clone)]
pub struct GenerationManager {
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<ModelStatus>,
}

impl GenerationManager {
    /// Start the manager worker and return a handle. Must be called inside a
    /// Tokio runtime. Nothing is loaded until the first request.
    pub fn start(config: ManagerConfig, loader: GeneratorLoader) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(config.queue_capacity.max(1));
        let (status_tx, status) = watch::channel(ModelStatus::NotLoaded);

        tokio::task::spawn_blocking(move || {
            let mut worker = Worker {
                generator: None,
                loader,
                config,
                status: status_tx,
            };
            worker.run(rx);
        });

        Self { tx, status }
    }

    pub fn status(&self) -> ModelStatus {
        self.status.borrow().clone()
    }

    /// Load the model now instead of on the first request.
    pub async fn preload(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Preload { reply }).await?;
        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }

    /// Generate one clip per prompt, in order.
    pub async fn generate_batch(&self, prompts: Vec<Prompt>) -> Result<Vec<GeneratedAudio>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Generate { prompts, reply }).await?;
        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }

    /// Submit a generation request and wait for the result.
    pub async fn generate(&self, prompt: Prompt) -> Result<GeneratedAudio> {
        self.generate_batch(vec![prompt])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Manager("generator returned no audio".into()))
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))
    }
}

/// State owned by the blocking worker thread.
struct Worker {
    generator: Option<Box<dyn MusicGenerator>>,
    loader: GeneratorLoader,
    config: ManagerConfig,
    status: watch::Sender<ModelStatus>,
}

impl Worker {
    fn run(&mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.blocking_recv() {
            // Ignore send errors: the caller may have gone away.
            match command {
                Command::Preload { reply } => {
                    let _ = reply.send(self.ensure_loaded());
                }
                Command::Generate { prompts, reply } => {
                    let _ = reply.send(self.generate_with_retry(&prompts));
                }
            }
        }
        tracing::info!("generation manager shut down");
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if self.generator.is_none() {
            let device = self.config.device();
            self.generator = Some(self.load(&device)?);
        }
        Ok(())
    }

    fn load(&self, device: &Device) -> Result<Box<dyn MusicGenerator>> {
        self.status.send_replace(ModelStatus::Loading);
        tracing::info!(device = ?device, "loading MusicGen model");

        let loaded = (self.loader)(device).and_then(|mut generator| {
            generator.set_generation_params(self.config.params.clone())?;
            Ok(generator)
        });
        match loaded {
            Ok(generator) => {
                self.status.send_replace(ModelStatus::Ready {
                    device: format!("{:?}", generator.device()),
                });
                Ok(generator)
            }
            Err(error) => {
                tracing::error!(%error, "model load failed");
                self.status.send_replace(ModelStatus::Failed {
                    error: error.to_string(),
                });
                Err(Error::ModelUnavailable(error.to_string()))
            }
        }
    }

    /// Try to generate. On OOM, reload on CPU and retry once.
    fn generate_with_retry(&mut self, prompts: &[Prompt]) -> Result<Vec<GeneratedAudio>> {
        self.ensure_loaded()?;
        let Some(generator) = self.generator.as_mut() else {
            return Err(Error::Manager("generator missing after load".into()));
        };
        match generator.generate(prompts) {
            Ok(audio) => Ok(audio),
            Err(ref error) if is_oom_error(error) => {
                tracing::warn!(%error, "out of memory, reloading model on CPU and retrying");
                // Free the accelerator copy before loading the CPU one.
                self.generator = None;
                let mut cpu_generator = self.load(&Device::Cpu)?;
                let result = cpu_generator
                    .generate(prompts)
                    .map_err(|e| Error::Manager(format!("generation failed even on CPU: {e}")));
                self.generator = Some(cpu_generator);
                result
            }
            Err(error) => Err(error),
        }
    }
}

/// Return the preferred device: CUDA, then Metal, otherwise CPU.
pub fn preferred_device(cuda_ordinal: usize) -> Device {
    if candle_core::utils::cuda_is_available() {
        if let Ok(device) = Device::new_cuda(cuda_ordinal) {
            return device;
        }
    }
    if candle_core::utils::metal_is_available() {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    Device::Cpu
}

/// Return true if the error looks like an accelerator out-of-memory condition.
///
/// Candle surfaces CUDA errors as `candle_core::Error::Cuda(Box<dyn Error>)` whose
/// `Display` contains the cudarc error string. We match on substrings
/// rather than types because the concrete error type is not exported.
pub fn is_oom_error(error: &crate::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("out of memory")
        || msg.contains("cudaerrormemorya") // cudaErrorMemoryAllocation
        || msg.contains("cuda_error_out_of_memory")
        || msg.contains("cublas_status_alloc_failed")
        || msg.contains("alloc failed")
        || msg.contains("failed to allocate")
}
