//! MusicGen causal decoder.
//!
//! Pre-LN transformer over summed codebook embeddings:
//!
//! ```text
//! tokens [B, K, T] ─ Σ_k embed_tokens[k] ─ + sinusoidal positions
//!                        ↓
//!        N × { LN → causal self-attn (KV cache)
//!              LN → cross-attn to text encoding
//!              LN → fc1 → GELU → fc2 }
//!                        ↓
//!             LN → lm_heads[k] → logits [B, K, T, vocab]
//! ```
//!
//! Weight layout follows the published checkpoint: `model.decoder.*` for the
//! stack and `lm_heads.{k}` for the per-codebook heads.

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};

use crate::config::DecoderConfig;
use crate::{Error, Result};

/// Fixed sinusoidal position table `[num_positions, dim]`: cosines in the
/// first half of each row, sines in the second.
fn sinusoidal_table(
    num_positions: usize,
    dim: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let half = dim / 2;
    let scale = 10_000f64.ln() / half.saturating_sub(1).max(1) as f64;
    let freqs: Vec<f64> = (0..half).map(|i| (-(i as f64) * scale).exp()).collect();

    let mut data = Vec::with_capacity(num_positions * dim);
    for pos in 0..num_positions {
        let pos = pos as f64;
        data.extend(freqs.iter().map(|f| (pos * f).cos() as f32));
        data.extend(freqs.iter().map(|f| (pos * f).sin() as f32));
        if dim % 2 == 1 {
            data.push(0.0);
        }
    }
    Ok(Tensor::from_vec(data, (num_positions, dim), device)?.to_dtype(dtype)?)
}

/// Additive F32 causal mask `[t, offset + t]` for `t` new positions after `offset` cached ones.
fn causal_mask(t: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let total = offset + t;
    let mask: Vec<f32> = (0..t)
        .flat_map(|i| {
            (0..total).map(move |j| {
                if j > i + offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (t, total), device)?)
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            q_proj: candle_nn::linear_no_bias(h, h, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear_no_bias(h, h, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear_no_bias(h, h, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear_no_bias(h, h, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
            scaling: (cfg.head_dim() as f64).powf(-0.5),
            kv_cache: None,
        })
    }

    /// `[B, T, H*D]` → `[B, H, T, D]`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        Ok(xs
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Self-attention over the new positions plus everything cached so far.
    fn forward_self(&mut self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let q = self.split_heads(&(self.q_proj.forward(xs)? * self.scaling)?)?;
        let k = self.split_heads(&self.k_proj.forward(xs)?)?;
        let v = self.split_heads(&self.v_proj.forward(xs)?)?;
        let (k, v) = match &self.kv_cache {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
            None => (k, v),
        };
        self.kv_cache = Some((k.clone(), v.clone()));
        self.attend(&q, &k, &v, mask)
    }

    /// Cross-attention; encoder keys/values are projected on the first call
    /// and reused until the cache is cleared.
    fn forward_cross(
        &mut self,
        xs: &Tensor,
        encoder_hidden_states: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = self.split_heads(&(self.q_proj.forward(xs)? * self.scaling)?)?;
        let (k, v) = match &self.kv_cache {
            Some(kv) => kv.clone(),
            None => {
                let k = self.split_heads(&self.k_proj.forward(encoder_hidden_states)?)?;
                let v = self.split_heads(&self.v_proj.forward(encoder_hidden_states)?)?;
                self.kv_cache = Some((k.clone(), v.clone()));
                (k, v)
            }
        };
        self.attend(&q, &k, &v, mask)
    }

    /// Scores, masking and softmax run in F32 so that large negative biases
    /// stay finite under half-precision weights.
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, _, t, _) = q.dims4()?;
        let scores = q.matmul(&k.t()?.contiguous()?)?.to_dtype(DType::F32)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(&mask.to_dtype(DType::F32)?)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(v.dtype())?;
        let out = probs
            .matmul(v)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        Ok(self.out_proj.forward(&out)?)
    }

    fn clear_kv_cache(&mut self) {
        self.kv_cache = None;
    }
}

struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
    fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        let eps = cfg.layer_norm_eps;
        Ok(Self {
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            self_attn_layer_norm: candle_nn::layer_norm(h, eps, vb.pp("self_attn_layer_norm"))?,
            encoder_attn: Attention::new(cfg, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: candle_nn::layer_norm(
                h,
                eps,
                vb.pp("encoder_attn_layer_norm"),
            )?,
            fc1: candle_nn::linear_no_bias(h, cfg.ffn_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear_no_bias(cfg.ffn_dim, h, vb.pp("fc2"))?,
            final_layer_norm: candle_nn::layer_norm(h, eps, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        encoder_hidden_states: &Tensor,
        causal_mask: Option<&Tensor>,
        encoder_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let h = self.self_attn_layer_norm.forward(xs)?;
        let h = self.self_attn.forward_self(&h, causal_mask)?;
        let xs = (xs + h)?;

        let h = self.encoder_attn_layer_norm.forward(&xs)?;
        let h = self
            .encoder_attn
            .forward_cross(&h, encoder_hidden_states, encoder_mask)?;
        let xs = (xs + h)?;

        let h = self.final_layer_norm.forward(&xs)?;
        let h = self.fc2.forward(&self.fc1.forward(&h)?.gelu_erf()?)?;
        Ok((xs + h)?)
    }

    fn clear_kv_cache(&mut self) {
        self.self_attn.clear_kv_cache();
        self.encoder_attn.clear_kv_cache();
    }
}

/// MusicGen decoder with per-codebook LM heads.
pub struct MusicgenDecoder {
    embed_tokens: Vec<Embedding>,
    positions: Tensor,
    layers: Vec<DecoderLayer>,
    layer_norm: LayerNorm,
    lm_heads: Vec<Linear>,
    cfg: DecoderConfig,
    seqlen_offset: usize,
}

impl MusicgenDecoder {
    /// Load from a VarBuilder rooted at the checkpoint's `decoder` prefix.
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let vb_stack = vb.pp("model.decoder");
        // One extra row per codebook for the pad/start token.
        let embed_tokens = (0..cfg.num_codebooks)
            .map(|k| {
                candle_nn::embedding(
                    cfg.vocab_size + 1,
                    cfg.hidden_size,
                    vb_stack.pp(format!("embed_tokens.{k}")),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| DecoderLayer::new(cfg, vb_stack.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let layer_norm =
            candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb_stack.pp("layer_norm"))?;
        let lm_heads = (0..cfg.num_codebooks)
            .map(|k| {
                candle_nn::linear_no_bias(
                    cfg.hidden_size,
                    cfg.vocab_size,
                    vb.pp(format!("lm_heads.{k}")),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let positions = sinusoidal_table(
            cfg.max_position_embeddings,
            cfg.hidden_size,
            vb.dtype(),
            vb.device(),
        )?;

        Ok(Self {
            embed_tokens,
            positions,
            layers,
            layer_norm,
            lm_heads,
            cfg: cfg.clone(),
            seqlen_offset: 0,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.cfg
    }

    /// Decode `input_ids` `[B, K, T]` (u32) continuing from the cached positions.
    ///
    /// - `encoder_hidden_states`: `[B, S, hidden]` projected text encoding
    /// - `encoder_mask`: additive F32 bias broadcastable to `[B, H, T, S]`
    ///
    /// Returns logits `[B, K, T, vocab]`.
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        encoder_hidden_states: &Tensor,
        encoder_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (_b, k, t) = input_ids.dims3()?;
        if k != self.cfg.num_codebooks {
            return Err(Error::Config(format!(
                "decoder expects {} codebooks, got {k}",
                self.cfg.num_codebooks
            )));
        }
        let offset = self.seqlen_offset;
        if offset + t > self.cfg.max_position_embeddings {
            return Err(Error::Config(format!(
                "sequence of {} positions exceeds the decoder limit of {}",
                offset + t,
                self.cfg.max_position_embeddings
            )));
        }

        let mut xs = self.embed_tokens[0].forward(&input_ids.i((.., 0, ..))?.contiguous()?)?;
        for (codebook, embed) in self.embed_tokens.iter().enumerate().skip(1) {
            let ids = input_ids.i((.., codebook, ..))?.contiguous()?;
            xs = (xs + embed.forward(&ids)?)?;
        }
        let xs = xs.broadcast_add(&self.positions.narrow(0, offset, t)?)?;

        let causal = if t > 1 {
            Some(causal_mask(t, offset, xs.device())?)
        } else {
            None
        };

        let mut xs = xs;
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, encoder_hidden_states, causal.as_ref(), encoder_mask)?;
        }
        self.seqlen_offset += t;

        let xs = self.layer_norm.forward(&xs)?;
        let logits = self
            .lm_heads
            .iter()
            .map(|head| head.forward(&xs))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::stack(&logits, 1)?)
    }

    /// Forget cached keys/values so the next call starts a new sequence.
    pub fn clear_kv_cache(&mut self) {
        self.seqlen_offset = 0;
        for layer in self.layers.iter_mut() {
            layer.clear_kv_cache();
        }
    }
}
