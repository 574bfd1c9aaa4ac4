//! Audio I/O utilities.
//!
//! WAV read/write for MusicGen's 32 kHz mono output, plus in-memory encoding
//! for the browser player.

mod wav;

pub use wav::{encode_wav, peak_normalize, read_wav, to_mono, write_wav};
