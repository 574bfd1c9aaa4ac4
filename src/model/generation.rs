//! Top-level MusicGen model combining all components.
//!
//! `MusicgenModel` orchestrates:
//! - Text encoding (T5 → `enc_to_dec_proj` → decoder width)
//! - Autoregressive codebook sampling with classifier-free guidance
//! - Code decoding to a 32 kHz waveform (EnCodec)

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::{encodec, t5};

use super::decoder::MusicgenDecoder;
use super::delay::DelayPattern;
use crate::config::{self, DecoderConfig, FRAME_RATE};
use crate::pipeline::GenerationParams;
use crate::Result;

/// Bias applied to masked encoder positions, in F32. Finite so that a fully
/// masked row (the unconditional half of the batch) softmaxes to uniform
/// weights over zero values instead of NaN.
const MASKED_BIAS: f64 = -1e9;

pub struct MusicgenModel {
    text_encoder: t5::T5EncoderModel,
    enc_to_dec_proj: Linear,
    decoder: MusicgenDecoder,
    codec: encodec::Model,
    device: Device,
    dtype: DType,
}

impl MusicgenModel {
    /// Load from a VarBuilder over the full `MusicgenForConditionalGeneration` checkpoint.
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let text_encoder =
            t5::T5EncoderModel::load(vb.pp("text_encoder"), &config::text_encoder_config())?;
        let enc_to_dec_proj = candle_nn::linear(
            cfg.text_hidden_size,
            cfg.hidden_size,
            vb.pp("enc_to_dec_proj"),
        )?;
        let decoder = MusicgenDecoder::new(cfg, vb.pp("decoder"))?;
        let codec = encodec::Model::new(&config::codec_config(), vb.pp("audio_encoder"))?;
        Ok(Self {
            text_encoder,
            enc_to_dec_proj,
            decoder,
            codec,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Encode tokenized prompts.
    ///
    /// Each prompt runs through T5 on its own so that no padding leaks into
    /// its self-attention; the results are right-padded with zeros to a
    /// common length.
    ///
    /// Returns `(encoder_hidden_states [B, S, hidden], encoder_mask [B, S])`.
    pub fn encode_prompts(&mut self, token_ids: &[Vec<u32>]) -> Result<(Tensor, Tensor)> {
        let mut hidden = Vec::with_capacity(token_ids.len());
        for ids in token_ids {
            let input = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
            self.text_encoder.clear_kv_cache();
            hidden.push(self.text_encoder.forward(&input)?.to_dtype(self.dtype)?); // [1, len, 768]
        }
        batch_encodings(&hidden, &self.enc_to_dec_proj)
    }

    /// Full text → waveform generation. Returns one mono buffer per prompt.
    pub fn generate(
        &mut self,
        token_ids: &[Vec<u32>],
        params: &GenerationParams,
    ) -> Result<Vec<Vec<f32>>> {
        let (encoder_hidden_states, encoder_mask) = self.encode_prompts(token_ids)?;
        let codes = sample_codes(
            &mut self.decoder,
            &encoder_hidden_states,
            &encoder_mask,
            params,
        )?;
        self.decode_codes(&codes)
    }

    /// Decode `[B][K][N]` codes to waveforms.
    pub fn decode_codes(&self, codes: &[Vec<Vec<u32>>]) -> Result<Vec<Vec<f32>>> {
        decode_with(&self.codec, codes, &self.device)
    }
}

/// Right-pad per-prompt encodings `[1, len_i, D]` with zeros to the longest,
/// project them to the decoder width and zero the padded positions again
/// (the projection has a bias).
///
/// Returns the projected states and an F32 `[B, S]` mask of 1 for real tokens.
fn batch_encodings(hidden: &[Tensor], proj: &Linear) -> Result<(Tensor, Tensor)> {
    let Some(first) = hidden.first() else {
        return Err(crate::Error::Config("no prompts to encode".into()));
    };
    let device = first.device();
    let lengths = hidden
        .iter()
        .map(|h| h.dim(1))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let max_len = lengths.iter().copied().max().unwrap_or(0).max(1);

    let padded = hidden
        .iter()
        .zip(&lengths)
        .map(|(h, &len)| h.pad_with_zeros(1, 0, max_len - len))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let mask: Vec<f32> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |i| if i < len { 1.0 } else { 0.0 }))
        .collect();
    let mask = Tensor::from_vec(mask, (hidden.len(), max_len), device)?;

    let states = proj.forward(&Tensor::cat(&padded, 0)?)?;
    let states = states.broadcast_mul(&mask.to_dtype(states.dtype())?.unsqueeze(2)?)?;
    Ok((states, mask))
}

/// Decode `[B][K][N]` codes with EnCodec and squeeze each item to a mono buffer.
fn decode_with(
    codec: &encodec::Model,
    codes: &[Vec<Vec<u32>>],
    device: &Device,
) -> Result<Vec<Vec<f32>>> {
    let batch = codes.len();
    let num_codebooks = codes.first().map(Vec::len).unwrap_or(0);
    let num_frames = codes
        .first()
        .and_then(|c| c.first())
        .map(Vec::len)
        .unwrap_or(0);
    let flat: Vec<u32> = codes.iter().flatten().flatten().copied().collect();
    let codes = Tensor::from_vec(flat, (batch, num_codebooks, num_frames), device)?;

    let audio = codec.decode(&codes)?; // [B, 1, T]
    tracing::debug!(shape = ?audio.dims(), "decoded audio");
    (0..batch)
        .map(|b| {
            Ok(audio
                .i(b)?
                .flatten_all()?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()?)
        })
        .collect()
}

/// Number of codec frames for a duration, truncating partial frames.
fn frames_for(duration_s: f64) -> usize {
    (duration_s * FRAME_RATE as f64) as usize
}

/// Combine the conditional (first `batch` rows) and unconditional (last
/// `batch` rows) logits: `uncond + (cond - uncond) * scale`.
pub fn apply_guidance(logits: &Tensor, batch: usize, scale: f64) -> Result<Tensor> {
    let cond = logits.narrow(0, 0, batch)?;
    let uncond = logits.narrow(0, batch, batch)?;
    Ok((&uncond + ((cond - &uncond)? * scale)?)?)
}

fn logits_processor(params: &GenerationParams) -> LogitsProcessor {
    let sampling = if params.temperature <= 0.0 {
        Sampling::ArgMax
    } else if params.top_k == 0 {
        Sampling::All {
            temperature: params.temperature,
        }
    } else {
        Sampling::TopK {
            k: params.top_k,
            temperature: params.temperature,
        }
    };
    let seed = params.seed.unwrap_or_else(rand::random);
    LogitsProcessor::from_sampling(seed, sampling)
}

/// Run the decoder autoregressively and return `[B][K][N]` codes.
///
/// Guidance is applied when `params.guidance_scale != 1.0`: the batch is
/// doubled with a zeroed, fully masked copy of the encoder states.
pub fn sample_codes(
    decoder: &mut MusicgenDecoder,
    encoder_hidden_states: &Tensor,
    encoder_mask: &Tensor,
    params: &GenerationParams,
) -> Result<Vec<Vec<Vec<u32>>>> {
    let cfg = decoder.config().clone();
    let batch = encoder_hidden_states.dim(0)?;
    let device = encoder_hidden_states.device().clone();
    let guided = (params.guidance_scale - 1.0).abs() > f64::EPSILON;

    let (states, mask) = if guided {
        (
            Tensor::cat(&[encoder_hidden_states, &encoder_hidden_states.zeros_like()?], 0)?,
            Tensor::cat(&[encoder_mask, &encoder_mask.zeros_like()?], 0)?,
        )
    } else {
        (encoder_hidden_states.clone(), encoder_mask.clone())
    };
    let rows = states.dim(0)?;
    // [rows, S] → additive F32 [rows, 1, 1, S]
    let bias = ((mask.to_dtype(DType::F32)? - 1.0)? * -MASKED_BIAS)?
        .unsqueeze(1)?
        .unsqueeze(1)?;

    let num_frames = frames_for(params.duration_s);
    let pattern = DelayPattern::new(cfg.num_codebooks, num_frames, cfg.pad_token_id());
    let mut processor = logits_processor(params);

    // sequences[b][k] starts with the start token
    let mut sequences = vec![vec![vec![pattern.pad_token()]; cfg.num_codebooks]; batch];

    decoder.clear_kv_cache();
    tracing::debug!(batch, num_frames, steps = pattern.num_steps(), guided, "sampling codes");

    for position in 1..=pattern.num_steps() {
        let last: Vec<u32> = (0..rows)
            .flat_map(|row| {
                let seq = &sequences[row % batch];
                seq.iter().map(|codebook| codebook[codebook.len() - 1])
            })
            .collect();
        let input = Tensor::from_vec(last, (rows, cfg.num_codebooks, 1), &device)?;

        let logits = decoder
            .forward(&input, &states, Some(&bias))?
            .squeeze(2)?
            .to_dtype(DType::F32)?; // [rows, K, V]
        let logits = if guided {
            apply_guidance(&logits, batch, params.guidance_scale)?
        } else {
            logits
        };

        for (b, sequence) in sequences.iter_mut().enumerate() {
            for (k, codebook) in sequence.iter_mut().enumerate() {
                let token = match pattern.forced_token(position, k) {
                    Some(token) => token,
                    None => processor.sample(&logits.i((b, k))?)?,
                };
                codebook.push(token);
            }
        }
    }
    decoder.clear_kv_cache();

    sequences
        .iter()
        .map(|sequence| pattern.undelay(sequence))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_decoder() -> MusicgenDecoder {
        let cfg = DecoderConfig {
            vocab_size: 8,
            max_position_embeddings: 64,
            num_hidden_layers: 1,
            ffn_dim: 16,
            num_attention_heads: 2,
            hidden_size: 8,
            num_codebooks: 4,
            layer_norm_eps: 1e-5,
            text_hidden_size: 8,
        };
        MusicgenDecoder::new(&cfg, VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap()
    }

    fn params(duration_s: f64, guidance_scale: f64) -> GenerationParams {
        GenerationParams {
            duration_s,
            guidance_scale,
            seed: Some(7),
            ..GenerationParams::default()
        }
    }

    #[test]
    fn test_apply_guidance() {
        // cond = [2, 4], uncond = [1, 1]
        let logits = Tensor::new(&[[2f32, 4.0], [1.0, 1.0]], &Device::Cpu).unwrap();
        let guided = apply_guidance(&logits, 1, 3.0).unwrap();
        let values: Vec<Vec<f32>> = guided.to_vec2().unwrap();
        assert_eq!(values, vec![vec![4.0, 10.0]]);
    }

    #[test]
    fn test_sample_codes_shape_and_range() {
        let mut decoder = tiny_decoder();
        let states = Tensor::zeros((2, 3, 8), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        // 0.1 s at 50 Hz = 5 frames
        let codes = sample_codes(&mut decoder, &states, &mask, &params(0.1, 3.0)).unwrap();

        assert_eq!(codes.len(), 2);
        for item in &codes {
            assert_eq!(item.len(), 4);
            for codebook in item {
                assert_eq!(codebook.len(), 5);
                assert!(codebook.iter().all(|&token| token < 8));
            }
        }
    }

    #[test]
    fn test_frames_for_truncates_partial_frames() {
        assert_eq!(frames_for(8.0), 400);
        assert_eq!(frames_for(0.119), 5);
        assert_eq!(frames_for(1.0), 50);
    }

    #[test]
    fn test_batch_encodings_pads_and_masks() {
        let device = Device::Cpu;
        let short = Tensor::ones((1, 2, 3), DType::F32, &device).unwrap();
        let long = (Tensor::ones((1, 4, 3), DType::F32, &device).unwrap() * 2.0).unwrap();
        let proj = Linear::new(
            Tensor::eye(3, DType::F32, &device).unwrap(),
            Some(Tensor::ones(3, DType::F32, &device).unwrap()),
        );

        let (states, mask) = batch_encodings(&[short, long], &proj).unwrap();
        assert_eq!(states.dims(), &[2, 4, 3]);
        assert_eq!(mask.dtype(), DType::F32);
        let mask: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1.0, 1.0, 0.0, 0.0], vec![1.0; 4]]);

        let states: Vec<Vec<Vec<f32>>> = states.to_vec3().unwrap();
        assert_eq!(states[0][1], vec![2.0; 3]);
        // padded positions stay zero despite the projection bias
        assert_eq!(states[0][2], vec![0.0; 3]);
        assert_eq!(states[0][3], vec![0.0; 3]);
        assert_eq!(states[1][3], vec![3.0; 3]);
    }

    #[test]
    fn test_batch_encodings_rejects_empty_batch() {
        let proj = Linear::new(Tensor::eye(3, DType::F32, &Device::Cpu).unwrap(), None);
        assert!(batch_encodings(&[], &proj).is_err());
    }

    #[test]
    fn test_guided_sampling_in_half_precision() {
        let cfg = tiny_decoder().config().clone();
        let mut decoder =
            MusicgenDecoder::new(&cfg, VarBuilder::zeros(DType::F16, &Device::Cpu)).unwrap();
        let states = Tensor::zeros((1, 3, 8), DType::F16, &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();

        let codes = sample_codes(&mut decoder, &states, &mask, &params(0.1, 3.0)).unwrap();
        assert_eq!(codes.len(), 1);
        assert!(codes[0].iter().flatten().all(|&token| token < 8));
    }

    #[test]
    fn test_decode_squeezes_each_item_to_mono() {
        let device = Device::Cpu;
        let codec =
            encodec::Model::new(&config::codec_config(), VarBuilder::zeros(DType::F32, &device))
                .unwrap();
        let codes = vec![vec![vec![1u32, 2]; 4], vec![vec![3u32, 4]; 4]];

        let audio = decode_with(&codec, &codes, &device).unwrap();
        let hop = (config::SAMPLE_RATE as usize) / FRAME_RATE;
        assert_eq!(audio.len(), 2);
        assert!(audio.iter().all(|samples| samples.len() == 2 * hop));
    }

    #[test]
    fn test_sample_codes_is_deterministic_for_seed() {
        let states = Tensor::zeros((1, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap();
        let first = sample_codes(&mut tiny_decoder(), &states, &mask, &params(0.1, 1.0)).unwrap();
        let second = sample_codes(&mut tiny_decoder(), &states, &mask, &params(0.1, 1.0)).unwrap();
        assert_eq!(first, second);
    }
}
