//! Holo streaming server library logic.

pub mod api_sessions;
pub mod api_ws;
pub mod background;
pub mod config;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use config::{Config, EnginesConfig};
use holo_session::{
    Collaborators, Engines, InvalidConfig, Orchestrator, StaticEntitlements, StaticProfiles,
    TurnStore,
};
use holo_voice::engines::{HttpGeneration, ProcessRecognition, ProcessSynthesis};
use holo_voice::scripted::{ScriptedGeneration, ScriptedRecognition, ScriptedSynthesis};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The session registry.
    pub orchestrator: Orchestrator,
    /// Largest accepted audio WebSocket frame, in bytes.
    pub max_audio_frame_bytes: usize,
}

/// Maximum JSON request body size (64 KiB).
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.orchestrator.len().await,
    }))
}

/// Builds the HTTP and WebSocket router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/sessions",
            post(api_sessions::create_session_handler).get(api_sessions::list_sessions_handler),
        )
        .route(
            "/api/sessions/{id}",
            get(api_sessions::get_session_handler).delete(api_sessions::end_session_handler),
        )
        .route(
            "/api/sessions/{id}/heartbeat",
            post(api_sessions::heartbeat_handler),
        )
        .route("/api/sessions/{id}/text", post(api_sessions::submit_text_handler))
        .route(
            "/api/sessions/{id}/devices",
            post(api_sessions::attach_device_handler),
        )
        .route(
            "/api/sessions/{id}/turns",
            get(api_sessions::list_turns_handler).delete(api_sessions::delete_turns_handler),
        )
        .route("/api/sessions/{id}/export", get(api_sessions::export_handler))
        .route("/ws/sessions/{id}/audio", get(api_ws::audio_ws_handler))
        .route("/ws/links/{link_id}", get(api_ws::link_ws_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

/// Instantiates the engines named in the `[engines]` section.
pub fn build_engines(config: &EnginesConfig) -> Engines {
    match config {
        EnginesConfig::Scripted {
            transcript,
            reply,
            chunk_delay_ms,
        } => {
            let delay = Duration::from_millis(*chunk_delay_ms);
            Engines {
                recognition: Arc::new(ScriptedRecognition::new(transcript.clone())),
                generation: Arc::new(
                    ScriptedGeneration::new(reply.clone()).with_delays(delay, delay),
                ),
                synthesis: Arc::new(ScriptedSynthesis::new()),
            }
        }
        EnginesConfig::Local {
            recognition,
            synthesis,
            generation,
        } => Engines {
            recognition: Arc::new(ProcessRecognition::new(
                &recognition.binary_path,
                &recognition.model_path,
                Duration::from_secs(recognition.timeout_secs),
            )),
            generation: Arc::new(HttpGeneration::new(generation.clone())),
            synthesis: Arc::new(ProcessSynthesis::new(
                &synthesis.binary_path,
                &synthesis.voices_dir,
                Duration::from_secs(synthesis.timeout_secs),
            )),
        },
    }
}

/// Wires the configured engines and collaborators into an orchestrator.
pub fn build_orchestrator(
    config: &Config,
    store: Arc<dyn TurnStore>,
) -> Result<Orchestrator, InvalidConfig> {
    let collaborators = Collaborators {
        entitlements: Arc::new(StaticEntitlements::new(
            config.entitlements.tiers.clone(),
            config.entitlements.default_tier,
        )),
        profiles: Arc::new(StaticProfiles::new(config.companions.clone())),
        store,
    };
    Orchestrator::new(
        config.pipeline.clone(),
        build_engines(&config.engines),
        collaborators,
    )
}
