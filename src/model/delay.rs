//! Codebook delay pattern.
//!
//! MusicGen predicts all codebooks of a frame in one decoder step, but
//! codebook `k` is shifted right by `k` positions so that it can condition on
//! the coarser codebooks of the same frame. With `K` codebooks and `N` frames
//! the decoder runs `N + K - 1` steps after the start token:
//!
//! ```text
//! position   0  1  2  3  4  5  6
//! codebook 0 P  a0 a1 a2 a3 P  P
//! codebook 1 P  P  b0 b1 b2 b3 P
//! codebook 2 P  P  P  c0 c1 c2 c3      (N = 4, K = 3)
//! ```
//!
//! `P` is the pad token, which doubles as the decoder start token.

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPattern {
    num_codebooks: usize,
    num_frames: usize,
    pad_token: u32,
}

impl DelayPattern {
    pub fn new(num_codebooks: usize, num_frames: usize, pad_token: u32) -> Self {
        Self {
            num_codebooks,
            num_frames,
            pad_token,
        }
    }

    /// Decoder steps needed after the start token.
    pub fn num_steps(&self) -> usize {
        self.num_frames + self.num_codebooks.saturating_sub(1)
    }

    pub fn pad_token(&self) -> u32 {
        self.pad_token
    }

    /// Token forced at `position` (1-based, position 0 is the start token)
    /// for `codebook`, or `None` when the model's sample is kept.
    pub fn forced_token(&self, position: usize, codebook: usize) -> Option<u32> {
        if position <= codebook || position > self.num_frames + codebook {
            Some(self.pad_token)
        } else {
            None
        }
    }

    /// Undo the delay: `sequence[k]` holds the start token plus every decoded
    /// step for codebook `k`; returns `[K][N]` aligned codes.
    pub fn undelay(&self, sequence: &[Vec<u32>]) -> Result<Vec<Vec<u32>>> {
        if sequence.len() != self.num_codebooks {
            return Err(Error::Config(format!(
                "expected {} codebooks, got {}",
                self.num_codebooks,
                sequence.len()
            )));
        }
        let expected_len = 1 + self.num_steps();
        sequence
            .iter()
            .enumerate()
            .map(|(k, row)| {
                if row.len() != expected_len {
                    return Err(Error::Config(format!(
                        "codebook {k}: expected {expected_len} positions, got {}",
                        row.len()
                    )));
                }
                Ok(row[1 + k..1 + k + self.num_frames].to_vec())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAD: u32 = 2048;

    #[test]
    fn test_num_steps() {
        assert_eq!(DelayPattern::new(4, 400, PAD).num_steps(), 403);
        assert_eq!(DelayPattern::new(1, 10, PAD).num_steps(), 10);
    }

    #[test]
    fn test_forced_tokens_follow_diagonal() {
        let pattern = DelayPattern::new(3, 4, PAD);
        // codebook 0 is free at positions 1..=4
        assert_eq!(pattern.forced_token(1, 0), None);
        assert_eq!(pattern.forced_token(4, 0), None);
        assert_eq!(pattern.forced_token(5, 0), Some(PAD));
        // codebook 2 waits two steps and runs to the end
        assert_eq!(pattern.forced_token(1, 2), Some(PAD));
        assert_eq!(pattern.forced_token(2, 2), Some(PAD));
        assert_eq!(pattern.forced_token(3, 2), None);
        assert_eq!(pattern.forced_token(6, 2), None);
    }

    #[test]
    fn test_undelay_aligns_frames() {
        let pattern = DelayPattern::new(3, 4, PAD);
        let sequence = vec![
            vec![PAD, 10, 11, 12, 13, PAD, PAD],
            vec![PAD, PAD, 20, 21, 22, 23, PAD],
            vec![PAD, PAD, PAD, 30, 31, 32, 33],
        ];
        let codes = pattern.undelay(&sequence).unwrap();
        assert_eq!(codes[0], vec![10, 11, 12, 13]);
        assert_eq!(codes[1], vec![20, 21, 22, 23]);
        assert_eq!(codes[2], vec![30, 31, 32, 33]);
    }

    #[test]
    fn test_undelay_rejects_wrong_shape() {
        let pattern = DelayPattern::new(2, 3, PAD);
        assert!(pattern.undelay(&[vec![PAD; 5]]).is_err());
        assert!(pattern.undelay(&[vec![PAD; 5], vec![PAD; 4]]).is_err());
    }
}
