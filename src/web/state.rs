//! Shared server state.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::body::Bytes;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::manager::GenerationManager;

/// Clips kept for playback. Older ones answer 404.
const CLIP_HISTORY: usize = 8;

#[derive(Clone)]
pub struct AppState {
    pub manager: GenerationManager,
    pub clips: Arc<ClipStore>,
}

impl AppState {
    pub fn new(manager: GenerationManager) -> Self {
        Self {
            manager,
            clips: Arc::new(ClipStore::default()),
        }
    }
}

/// A generated clip, encoded for the browser.
#[derive(Debug, Clone, Serialize)]
pub struct StoredClip {
    pub id: Uuid,
    pub prompt: String,
    pub sample_rate: u32,
    pub duration_s: f64,
    #[serde(skip)]
    pub wav: Bytes,
}

impl StoredClip {
    pub fn audio_url(&self) -> String {
        format!("/api/audio/{}", self.id)
    }
}

/// Recent clips for the whole process, newest first.
#[derive(Default)]
pub struct ClipStore {
    clips: RwLock<VecDeque<Arc<StoredClip>>>,
}

impl ClipStore {
    pub async fn insert(&self, clip: StoredClip) -> Arc<StoredClip> {
        let clip = Arc::new(clip);
        let mut clips = self.clips.write().await;
        clips.push_front(clip.clone());
        clips.truncate(CLIP_HISTORY);
        clip
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<StoredClip>> {
        self.clips
            .read()
            .await
            .iter()
            .find(|clip| clip.id == id)
            .cloned()
    }

    pub async fn last(&self) -> Option<Arc<StoredClip>> {
        self.clips.read().await.front().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(prompt: &str) -> StoredClip {
        StoredClip {
            id: Uuid::new_v4(),
            prompt: prompt.to_string(),
            sample_rate: 32_000,
            duration_s: 8.0,
            wav: Bytes::from_static(b"RIFF"),
        }
    }

    #[tokio::test]
    async fn test_last_is_newest() {
        let store = ClipStore::default();
        assert!(store.last().await.is_none());

        let first = store.insert(clip("first")).await;
        let second = store.insert(clip("second")).await;
        assert_eq!(store.last().await.unwrap().id, second.id);
        assert_eq!(store.get(first.id).await.unwrap().prompt, "first");
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = ClipStore::default();
        let oldest = store.insert(clip("oldest")).await;
        for i in 0..CLIP_HISTORY {
            store.insert(clip(&format!("clip {i}"))).await;
        }
        assert!(store.get(oldest.id).await.is_none());
        assert_eq!(store.last().await.unwrap().prompt, format!("clip {}", CLIP_HISTORY - 1));
    }

    #[test]
    fn test_audio_url() {
        let clip = clip("x");
        assert_eq!(clip.audio_url(), format!("/api/audio/{}", clip.id));
    }
}
