//! Text prompts and genre presets.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Message shown when the prompt is blank.
pub const EMPTY_PROMPT_MESSAGE: &str = "Please enter a music description first!";

/// Prompt the UI starts with.
pub const DEFAULT_PROMPT: &str = "upbeat afrobeats song with guitar solo";

/// Prompts used by `musicgen-generate` when none are given.
pub const DEFAULT_CLI_PROMPTS: [&str; 2] = [
    "Chill Afrobeats with electric guitar and drums",
    "catchy afrobeats song with upbeat melody",
];

/// A trimmed, non-empty music description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Prompt(String);

impl Prompt {
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidPrompt(EMPTY_PROMPT_MESSAGE.into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Prompt {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Prompt::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A genre and its preset prompts, in sidebar order.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GenrePresets {
    pub genre: &'static str,
    pub prompts: &'static [&'static str],
}

pub const GENRE_PRESETS: &[GenrePresets] = &[
    GenrePresets {
        genre: "Afrobeats",
        prompts: &[
            "upbeat afrobeats song with guitar solo",
            "energetic afrobeats song with heavy drums",
            "melodic afrobeats ballad with piano",
            "afrobeats song with bass guitar riff",
            "chill afrobeats with electric guitar and drums",
        ],
    },
    GenrePresets {
        genre: "Electronic",
        prompts: &[
            "ambient electronic music with synthesizers",
            "upbeat techno beat with bass drops",
            "dreamy synth-pop melody",
            "energetic EDM track with heavy bass",
        ],
    },
    GenrePresets {
        genre: "Classical",
        prompts: &[
            "peaceful piano melody",
            "orchestral symphony with strings",
            "classical guitar piece",
            "baroque style composition",
        ],
    },
    GenrePresets {
        genre: "Jazz",
        prompts: &[
            "smooth jazz with saxophone",
            "upbeat jazz with piano and drums",
            "jazz fusion with electric guitar",
            "mellow jazz ballad",
        ],
    },
    GenrePresets {
        genre: "Rock",
        prompts: &[
            "energetic rock song with guitar riffs",
            "heavy metal with drums and bass",
            "acoustic rock ballad",
            "indie rock with catchy melody",
        ],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_is_trimmed() {
        let prompt = Prompt::parse("  smooth jazz with saxophone \n").unwrap();
        assert_eq!(prompt.as_str(), "smooth jazz with saxophone");
    }

    #[test]
    fn test_blank_prompt_rejected() {
        for text in ["", "   ", "\t\n"] {
            match Prompt::parse(text) {
                Err(Error::InvalidPrompt(message)) => assert_eq!(message, EMPTY_PROMPT_MESSAGE),
                other => panic!("expected InvalidPrompt, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_prompt_deserialize_validates() {
        let prompt: Prompt = serde_json::from_str(r#"" rock ""#).unwrap();
        assert_eq!(prompt.as_str(), "rock");
        assert!(serde_json::from_str::<Prompt>(r#""  ""#).is_err());
    }

    #[test]
    fn test_presets() {
        let genres: Vec<_> = GENRE_PRESETS.iter().map(|entry| entry.genre).collect();
        assert_eq!(genres, ["Afrobeats", "Electronic", "Classical", "Jazz", "Rock"]);
        assert_eq!(GENRE_PRESETS[0].prompts.len(), 5);
        assert_eq!(GENRE_PRESETS[3].prompts.len(), 4);
        assert_eq!(GENRE_PRESETS[0].prompts[0], DEFAULT_PROMPT);
    }
}
