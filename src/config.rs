//! Configuration for the MusicGen checkpoints.
//!
//! Matches the published `facebook/musicgen-*` configs: a T5-base text
//! encoder, a causal decoder over 4 EnCodec codebooks, and the 32 kHz EnCodec
//! codec that turns codes back into audio.

use std::fmt;
use std::str::FromStr;

use candle_transformers::models::{encodec, t5};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Output sample rate of the 32 kHz EnCodec codec.
pub const SAMPLE_RATE: u32 = 32_000;

/// Codec frames per second (32000 / hop length 640).
pub const FRAME_RATE: usize = 50;

/// Published MusicGen checkpoint sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    #[default]
    Small,
    Medium,
    Large,
}

impl ModelVariant {
    /// HuggingFace repo id, e.g. `facebook/musicgen-small`.
    pub fn repo_id(&self) -> &'static str {
        match self {
            Self::Small => "facebook/musicgen-small",
            Self::Medium => "facebook/musicgen-medium",
            Self::Large => "facebook/musicgen-large",
        }
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        match self {
            Self::Small => DecoderConfig::default(),
            Self::Medium => DecoderConfig {
                hidden_size: 1536,
                num_hidden_layers: 48,
                num_attention_heads: 24,
                ffn_dim: 6144,
                ..DecoderConfig::default()
            },
            Self::Large => DecoderConfig {
                hidden_size: 2048,
                num_hidden_layers: 48,
                num_attention_heads: 32,
                ffn_dim: 8192,
                ..DecoderConfig::default()
            },
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        };
        f.write_str(name)
    }
}

impl FromStr for ModelVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "small" | "facebook/musicgen-small" => Ok(Self::Small),
            "medium" | "facebook/musicgen-medium" => Ok(Self::Medium),
            "large" | "facebook/musicgen-large" => Ok(Self::Large),
            other => Err(Error::Config(format!(
                "unknown model variant '{other}', expected small, medium or large"
            ))),
        }
    }
}

/// MusicGen causal decoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Codebook entries per codebook. The pad/bos token id equals this value.
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub num_hidden_layers: usize,
    pub ffn_dim: usize,
    pub num_attention_heads: usize,
    pub hidden_size: usize,
    pub num_codebooks: usize,
    pub layer_norm_eps: f64,
    /// Hidden size of the text encoder feeding `enc_to_dec_proj`.
    pub text_hidden_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 2048,
            max_position_embeddings: 2048,
            num_hidden_layers: 24,
            ffn_dim: 4096,
            num_attention_heads: 16,
            hidden_size: 1024,
            num_codebooks: 4,
            layer_norm_eps: 1e-5,
            text_hidden_size: 768,
        }
    }
}

impl DecoderConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Token used for both the decoder start and the delay-pattern padding.
    pub fn pad_token_id(&self) -> u32 {
        self.vocab_size as u32
    }
}

/// T5-base text encoder shared by all MusicGen sizes.
pub fn text_encoder_config() -> t5::Config {
    t5::Config::musicgen_small()
}

/// EnCodec 32 kHz codec config (`audio_encoder` in the checkpoint).
///
/// The checkpoint asks for reflect padding, which candle does not implement;
/// replicate padding is the closest supported mode.
pub fn codec_config() -> encodec::Config {
    encodec::Config {
        target_bandwidths: vec![2.2],
        sampling_rate: SAMPLE_RATE as usize,
        audio_channels: 1,
        normalize: false,
        chunk_length_s: None,
        overlap: None,
        hidden_size: 128,
        num_filters: 64,
        num_residual_layers: 1,
        upsampling_ratios: vec![8, 5, 4, 4],
        norm_type: encodec::NormType::WeightNorm,
        kernel_size: 7,
        last_kernel_size: 7,
        residual_kernel_size: 3,
        dilation_growth_rate: 2,
        use_causal_conv: false,
        pad_mode: encodec::PadMode::Replicate,
        compress: 2,
        num_lstm_layers: 2,
        trim_right_ratio: 1.0,
        codebook_size: 2048,
        codebook_dim: Some(128),
        use_conv_shortcut: false,
    }
}
