//! End-to-end inference pipeline.
//!
//! Orchestrates text-to-music generation:
//! 1. Resolve checkpoint files (HuggingFace cache or a local directory)
//! 2. Tokenize prompts (T5 SentencePiece tokenizer)
//! 3. Encode text, sample codebooks, decode with EnCodec ([`MusicgenModel`])
//! 4. Return one mono sample buffer per prompt

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::config::{ModelVariant, SAMPLE_RATE};
use crate::model::generation::MusicgenModel;
use crate::prompt::Prompt;
use crate::{Error, Result};

pub const MIN_DURATION_S: f64 = 1.0;
pub const MAX_DURATION_S: f64 = 30.0;

const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Sampling and length knobs, fixed on the model handle at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Seconds of audio per prompt (1–30).
    pub duration_s: f64,
    /// Keep the `top_k` most likely tokens per step. 0 samples from the full distribution.
    pub top_k: usize,
    /// Softmax temperature. 0 selects greedily.
    pub temperature: f64,
    /// Classifier-free guidance scale. 1 disables guidance.
    pub guidance_scale: f64,
    /// Random seed. `None` draws a fresh seed per request.
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            duration_s: 8.0,
            top_k: 250,
            temperature: 1.0,
            guidance_scale: 3.0,
            seed: None,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_DURATION_S..=MAX_DURATION_S).contains(&self.duration_s) {
            return Err(Error::Config(format!(
                "duration must be between {MIN_DURATION_S} and {MAX_DURATION_S} seconds, got {}",
                self.duration_s
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::Config(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 1.0 {
            return Err(Error::Config(format!(
                "guidance_scale must be >= 1, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }
}

/// Output of a generation run.
#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    /// Interleaved samples, `[-1, 1]` nominal range.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl GeneratedAudio {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn duration_s(&self) -> f64 {
        let frames = self.samples.len() / self.channels.max(1) as usize;
        frames as f64 / self.sample_rate as f64
    }
}

/// A loaded text-to-music model.
///
/// The manager and web layers are written against this trait so tests can
/// swap in a generator that does not need checkpoint weights.
pub trait MusicGenerator: Send {
    fn device(&self) -> &Device;

    fn set_generation_params(&mut self, params: GenerationParams) -> Result<()>;

    /// Generate one buffer per prompt, in prompt order.
    fn generate(&mut self, prompts: &[Prompt]) -> Result<Vec<GeneratedAudio>>;
}

/// Where the checkpoint comes from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSource {
    pub variant: ModelVariant,
    /// Hub repo override, e.g. a fine-tuned fork with the same layout.
    pub repo: Option<String>,
    pub revision: Option<String>,
    /// Directory holding `model.safetensors` (or an index plus shards) and
    /// `tokenizer.json`. Skips the hub entirely.
    pub local_dir: Option<PathBuf>,
}

/// Resolved paths for one checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub weights: Vec<PathBuf>,
    pub tokenizer: PathBuf,
}

impl ModelSource {
    pub fn repo_id(&self) -> String {
        self.repo
            .clone()
            .unwrap_or_else(|| self.variant.repo_id().to_string())
    }

    /// Locate (downloading on first use) the tokenizer and weight files.
    pub fn resolve(&self) -> Result<ModelFiles> {
        match &self.local_dir {
            Some(dir) => resolve_local(dir),
            None => self.resolve_hub(),
        }
    }

    /// Only the tokenizer, for cheap availability probes.
    pub fn resolve_tokenizer(&self) -> Result<PathBuf> {
        match &self.local_dir {
            Some(dir) => existing(dir.join(TOKENIZER_FILE)),
            None => Ok(self.hub_repo()?.get(TOKENIZER_FILE)?),
        }
    }

    fn hub_repo(&self) -> Result<hf_hub::api::sync::ApiRepo> {
        let api = Api::new()?;
        let repo_id = self.repo_id();
        let repo = match &self.revision {
            Some(revision) => Repo::with_revision(repo_id, RepoType::Model, revision.clone()),
            None => Repo::new(repo_id, RepoType::Model),
        };
        Ok(api.repo(repo))
    }

    fn resolve_hub(&self) -> Result<ModelFiles> {
        let repo = self.hub_repo()?;
        tracing::info!(repo = %self.repo_id(), "resolving MusicGen checkpoint");

        let tokenizer = repo.get(TOKENIZER_FILE)?;
        let weights = match repo.get(SINGLE_WEIGHTS_FILE) {
            Ok(path) => vec![path],
            Err(single_error) => {
                tracing::debug!(%single_error, "no single weights file, trying sharded index");
                let index = repo.get(WEIGHTS_INDEX_FILE)?;
                shard_names(&std::fs::read_to_string(index)?)?
                    .iter()
                    .map(|name| repo.get(name).map_err(Error::from))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        Ok(ModelFiles { weights, tokenizer })
    }
}

fn existing(path: PathBuf) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::WeightLoad(format!("missing file: {}", path.display())))
    }
}

fn resolve_local(dir: &Path) -> Result<ModelFiles> {
    let tokenizer = existing(dir.join(TOKENIZER_FILE))?;
    let single = dir.join(SINGLE_WEIGHTS_FILE);
    let weights = if single.is_file() {
        vec![single]
    } else {
        let index = existing(dir.join(WEIGHTS_INDEX_FILE))?;
        shard_names(&std::fs::read_to_string(index)?)?
            .into_iter()
            .map(|name| existing(dir.join(name)))
            .collect::<Result<Vec<_>>>()?
    };
    Ok(ModelFiles { weights, tokenizer })
}

/// Unique shard file names from a `model.safetensors.index.json`, sorted.
pub fn shard_names(index_json: &str) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(index_json)?;
    let weight_map = index
        .get("weight_map")
        .and_then(|map| map.as_object())
        .ok_or_else(|| Error::WeightLoad("index has no weight_map".into()))?;
    let names: BTreeSet<String> = weight_map
        .values()
        .filter_map(|value| value.as_str().map(str::to_string))
        .collect();
    if names.is_empty() {
        return Err(Error::WeightLoad("index lists no shards".into()));
    }
    Ok(names.into_iter().collect())
}

/// MusicGen text-to-music pipeline.
pub struct MusicgenPipeline {
    model: MusicgenModel,
    tokenizer: Tokenizer,
    params: GenerationParams,
    variant: ModelVariant,
    device: Device,
}

impl MusicgenPipeline {
    /// Resolve the checkpoint (downloading if needed) and load it on `device`.
    pub fn load(source: &ModelSource, device: &Device, dtype: DType) -> Result<Self> {
        let files = source.resolve()?;
        Self::from_files(files, source.variant, device, dtype)
    }

    pub fn from_files(
        files: ModelFiles,
        variant: ModelVariant,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let start = Instant::now();

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| Error::WeightLoad(format!("tokenizer load: {e}")))?;

        // SAFETY: the safetensors files are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device) }
            .map_err(|e| Error::WeightLoad(format!("MusicGen weights: {e}")))?;
        let model = MusicgenModel::new(&variant.decoder_config(), vb)
            .map_err(|e| Error::WeightLoad(format!("MusicGen model init: {e}")))?;

        tracing::info!(
            %variant,
            device = ?device,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "MusicGen loaded"
        );

        Ok(Self {
            model,
            tokenizer,
            params: GenerationParams::default(),
            variant,
            device: device.clone(),
        })
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    fn tokenize(&self, prompts: &[Prompt]) -> Result<Vec<Vec<u32>>> {
        prompts
            .iter()
            .map(|prompt| {
                let encoding = self.tokenizer.encode(prompt.as_str(), true)?;
                Ok(encoding.get_ids().to_vec())
            })
            .collect()
    }
}

impl MusicGenerator for MusicgenPipeline {
    fn device(&self) -> &Device {
        &self.device
    }

    fn set_generation_params(&mut self, params: GenerationParams) -> Result<()> {
        params.validate()?;
        self.params = params;
        Ok(())
    }

    fn generate(&mut self, prompts: &[Prompt]) -> Result<Vec<GeneratedAudio>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let token_ids = self.tokenize(prompts)?;
        let waveforms = self.model.generate(&token_ids, &self.params)?;

        tracing::info!(
            prompts = prompts.len(),
            duration_s = self.params.duration_s,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generation complete"
        );

        Ok(waveforms
            .into_iter()
            .map(|samples| GeneratedAudio::mono(samples, SAMPLE_RATE))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_params_defaults() {
        let params = GenerationParams::default();
        assert_eq!(params.duration_s, 8.0);
        assert_eq!(params.top_k, 250);
        assert_eq!(params.temperature, 1.0);
        assert_eq!(params.guidance_scale, 3.0);
        assert!(params.seed.is_none());
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_generation_params_validation() {
        let with = |f: fn(&mut GenerationParams)| {
            let mut params = GenerationParams::default();
            f(&mut params);
            params.validate()
        };
        assert!(with(|p| p.duration_s = 0.5).is_err());
        assert!(with(|p| p.duration_s = 31.0).is_err());
        assert!(with(|p| p.duration_s = f64::NAN).is_err());
        assert!(with(|p| p.duration_s = 30.0).is_ok());
        assert!(with(|p| p.temperature = -0.1).is_err());
        assert!(with(|p| p.temperature = 0.0).is_ok());
        assert!(with(|p| p.guidance_scale = 0.5).is_err());
        assert!(with(|p| p.guidance_scale = 1.0).is_ok());
    }

    #[test]
    fn test_generation_params_partial_json() {
        let params: GenerationParams = serde_json::from_str(r#"{"duration_s": 12, "seed": 3}"#).unwrap();
        assert_eq!(params.duration_s, 12.0);
        assert_eq!(params.seed, Some(3));
        assert_eq!(params.top_k, 250);
    }

    #[test]
    fn test_generated_audio_duration() {
        let audio = GeneratedAudio::mono(vec![0.0; 64_000], 32_000);
        assert_eq!(audio.duration_s(), 2.0);
        let stereo = GeneratedAudio {
            samples: vec![0.0; 64_000],
            sample_rate: 32_000,
            channels: 2,
        };
        assert_eq!(stereo.duration_s(), 1.0);
    }

    #[test]
    fn test_shard_names_dedup_and_sort() {
        let index = r#"{
            "metadata": {"total_size": 1},
            "weight_map": {
                "decoder.lm_heads.0.weight": "model-00002-of-00002.safetensors",
                "text_encoder.shared.weight": "model-00001-of-00002.safetensors",
                "audio_encoder.quantizer.layers.0.codebook.embed": "model-00001-of-00002.safetensors"
            }
        }"#;
        assert_eq!(
            shard_names(index).unwrap(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
        assert!(shard_names(r#"{"weight_map": {}}"#).is_err());
        assert!(shard_names(r#"{"metadata": {}}"#).is_err());
    }

    #[test]
    fn test_model_source_repo_id() {
        let source = ModelSource::default();
        assert_eq!(source.repo_id(), "facebook/musicgen-small");
        let source = ModelSource {
            variant: ModelVariant::Medium,
            ..ModelSource::default()
        };
        assert_eq!(source.repo_id(), "facebook/musicgen-medium");
        let source = ModelSource {
            repo: Some("me/musicgen-finetune".into()),
            ..ModelSource::default()
        };
        assert_eq!(source.repo_id(), "me/musicgen-finetune");
    }

    #[test]
    fn test_resolve_local_single_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILE), "{}").unwrap();
        std::fs::write(dir.path().join(SINGLE_WEIGHTS_FILE), b"").unwrap();

        let files = resolve_local(dir.path()).unwrap();
        assert_eq!(files.weights, vec![dir.path().join(SINGLE_WEIGHTS_FILE)]);
        assert_eq!(files.tokenizer, dir.path().join(TOKENIZER_FILE));
    }

    #[test]
    fn test_resolve_local_sharded_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILE), "{}").unwrap();
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {"a": "shard-1.safetensors", "b": "shard-2.safetensors"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("shard-1.safetensors"), b"").unwrap();

        // shard-2 missing
        assert!(matches!(resolve_local(dir.path()), Err(Error::WeightLoad(_))));

        std::fs::write(dir.path().join("shard-2.safetensors"), b"").unwrap();
        let files = resolve_local(dir.path()).unwrap();
        assert_eq!(files.weights.len(), 2);

        let empty = tempfile::tempdir().unwrap();
        assert!(resolve_local(empty.path()).is_err());
    }
}
