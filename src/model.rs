//! Model components for MusicGen.
//!
//! ## Components
//!
//! - [`decoder`]: the causal transformer over codebook tokens
//! - [`delay`]: codebook delay pattern used while sampling
//! - [`generation`]: T5 + decoder + EnCodec, text in and waveform out

pub mod decoder;
pub mod delay;
pub mod generation;
