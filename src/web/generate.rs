//! Generation endpoints.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ApiError;
use super::json::JsonBody;
use super::state::{AppState, StoredClip};
use crate::audio::{encode_wav, to_mono};
use crate::prompt::{GenrePresets, Prompt, DEFAULT_PROMPT, GENRE_PRESETS};

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct ClipResponse {
    pub id: Uuid,
    pub prompt: String,
    pub sample_rate: u32,
    pub duration_s: f64,
    pub audio_url: String,
}

impl From<&StoredClip> for ClipResponse {
    fn from(clip: &StoredClip) -> Self {
        Self {
            id: clip.id,
            prompt: clip.prompt.clone(),
            sample_rate: clip.sample_rate,
            duration_s: clip.duration_s,
            audio_url: clip.audio_url(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PresetsResponse {
    pub default_prompt: &'static str,
    pub genres: &'static [GenrePresets],
}

pub async fn presets() -> Json<PresetsResponse> {
    Json(PresetsResponse {
        default_prompt: DEFAULT_PROMPT,
        genres: GENRE_PRESETS,
    })
}

/// Text in, playable clip out.
pub async fn generate(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<GenerateRequest>,
) -> Result<Json<ClipResponse>, ApiError> {
    let prompt = Prompt::parse(&request.prompt)?;
    tracing::info!(%prompt, "generating music");

    let audio = state.manager.generate(prompt.clone()).await?;
    let samples = to_mono(&audio.samples, audio.channels);
    let wav = encode_wav(&samples, audio.sample_rate, 1)?;

    let clip = state
        .clips
        .insert(StoredClip {
            id: Uuid::new_v4(),
            prompt: prompt.to_string(),
            sample_rate: audio.sample_rate,
            duration_s: samples.len() as f64 / audio.sample_rate as f64,
            wav: Bytes::from(wav),
        })
        .await;

    tracing::info!(id = %clip.id, duration_s = clip.duration_s, "music generated");
    Ok(Json(ClipResponse::from(clip.as_ref())))
}

pub async fn audio(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let clip = state
        .clips
        .get(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no clip with id {id}")))?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], clip.wav.clone()))
}

pub async fn last(State(state): State<AppState>) -> Result<Json<ClipResponse>, ApiError> {
    let clip = state
        .clips
        .last()
        .await
        .ok_or_else(|| ApiError::not_found("nothing generated yet"))?;
    Ok(Json(ClipResponse::from(clip.as_ref())))
}
