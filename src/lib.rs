//! MusicGen text-to-music generation in pure Rust.
//!
//! A candle-based implementation of Meta's MusicGen, wrapped in a small
//! browser front end and two command-line tools. Loads the published
//! `facebook/musicgen-*` safetensors checkpoints directly.
//!
//! ## Architecture
//!
//! ```text
//! prompt → T5 encoder → enc_to_dec_proj ─┐
//!                                         ↓ cross-attention
//!            decoder (4 delayed codebooks, classifier-free guidance)
//!                                         ↓
//!                     EnCodec decoder (codes → 32 kHz mono)
//! ```
//!
//! ## Modules
//!
//! - [`config`]: checkpoint variants, decoder and codec configs
//! - [`model`]: decoder, delay pattern, full model
//! - [`pipeline`]: checkpoint resolution and the [`pipeline::MusicGenerator`] seam
//! - [`manager`]: the process-wide cached model handle
//! - [`audio`]: WAV I/O
//! - [`web`]: axum front end
//! - [`doctor`]: environment checks

pub mod audio;
pub mod config;
pub mod doctor;
pub mod logging;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod prompt;
pub mod settings;
pub mod web;

mod error;

pub use error::{Error, Result};
