use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::state::AppState;
use super::{generate, health, page};

/// Create the full router with application state.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(page::index))
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .route("/api/presets", get(generate::presets))
        .route("/api/generate", post(generate::generate))
        .route("/api/audio/{id}", get(generate::audio))
        .route("/api/last", get(generate::last))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::manager::testing::{cpu_config, fake_loader, FakeScript, FAKE_SAMPLE_RATE};
    use crate::manager::GenerationManager;

    fn app(script: Arc<FakeScript>) -> Router {
        let manager = GenerationManager::start(cpu_config(), fake_loader(script));
        create_router(AppState::new(manager))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn generate_request(prompt: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "prompt": prompt }).to_string()))
            .unwrap()
    }

    fn json_body(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_index_page() {
        let app = app(Arc::new(FakeScript::default()));
        let (status, body) = send(&app, get_request("/")).await;
        assert_eq!(status, StatusCode::OK);
        let html = String::from_utf8(body).unwrap();
        assert!(html.contains("MusicGen Music Generator"));
        assert!(html.contains("/api/generate"));
    }

    #[tokio::test]
    async fn test_presets() {
        let app = app(Arc::new(FakeScript::default()));
        let (status, body) = send(&app, get_request("/api/presets")).await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body["default_prompt"], "upbeat afrobeats song with guitar solo");
        assert_eq!(body["genres"].as_array().unwrap().len(), 5);
        assert_eq!(body["genres"][3]["genre"], "Jazz");
    }

    #[tokio::test]
    async fn test_generate_then_fetch_audio() {
        let script = Arc::new(FakeScript::default());
        let app = app(script.clone());

        let (status, body) = send(&app, generate_request("  smooth jazz with saxophone ")).await;
        assert_eq!(status, StatusCode::OK);
        let clip = json_body(&body);
        assert_eq!(clip["prompt"], "smooth jazz with saxophone");
        assert_eq!(clip["sample_rate"], FAKE_SAMPLE_RATE);
        assert_eq!(clip["duration_s"], 2.0);

        let audio_url = clip["audio_url"].as_str().unwrap().to_string();
        let response = app.clone().oneshot(get_request(&audio_url)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");
        let wav = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), 44 + 2 * 2 * FAKE_SAMPLE_RATE as usize);

        let (status, body) = send(&app, get_request("/api/last")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["id"], clip["id"]);
        assert_eq!(script.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected_without_loading() {
        let script = Arc::new(FakeScript::default());
        let app = app(script.clone());

        let (status, body) = send(&app, generate_request("   ")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(&body)["error"]["message"],
            "Please enter a music description first!"
        );
        assert_eq!(script.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_gets_json_error() {
        let script = Arc::new(FakeScript::default());
        let app = app(script.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/api/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body = json_body(&body);
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Invalid JSON syntax"));

        let request = Request::builder()
            .method("POST")
            .uri("/api/generate")
            .body(Body::from(r#"{"prompt": "jazz"}"#))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(json_body(&body)["error"]["type"], "invalid_request_error");
        assert_eq!(script.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_model_load_failure_is_503() {
        let script = Arc::new(FakeScript::default());
        script.failing_loads.store(1, Ordering::SeqCst);
        let app = app(script);

        let (status, body) = send(&app, generate_request("classical guitar piece")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(&body)["error"]["type"], "service_unavailable_error");

        let (status, _) = send(&app, get_request("/ready")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_generation_failure_is_500() {
        let script = Arc::new(FakeScript::default());
        script.failures.store(1, Ordering::SeqCst);
        let app = app(script);

        let (status, body) = send(&app, generate_request("baroque style composition")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let message = json_body(&body)["error"]["message"].as_str().unwrap().to_string();
        assert!(message.starts_with("Error generating music"));

        let (status, _) = send(&app, get_request("/api/last")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_clip_is_404() {
        let app = app(Arc::new(FakeScript::default()));
        let uri = format!("/api/audio/{}", uuid::Uuid::new_v4());
        let (status, _) = send(&app, get_request(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let app = app(Arc::new(FakeScript::default()));
        let (status, body) = send(&app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["status"], "healthy");

        let (status, body) = send(&app, get_request("/ready")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(&body)["model"]["state"], "not_loaded");

        send(&app, generate_request("mellow jazz ballad")).await;
        let (status, body) = send(&app, get_request("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["model"]["state"], "ready");
    }
}
