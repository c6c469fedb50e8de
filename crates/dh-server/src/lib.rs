//! Digital-human server library logic.
//!
//! [`AppState`] is built once at startup from [`config::Config`] and handed
//! to every handler; there are no process-wide globals.

pub mod api;
pub mod api_ws;
pub mod background;
pub mod config;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use config::Config;
use dh_engine::{AudioCache, EngineError, EnginePool, EngineRegistries};
use dh_pipeline::{ContextManager, ConversationPipeline};
use dh_voice::{EchoMimicGenerator, VideoGenerator, VoiceError};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Default request body ceiling when a state is built without a config.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Lazily-built engine instances, shared by every connection.
    pub pool: Arc<EnginePool>,
    /// Pipeline wired to the configured default engines.
    pub pipeline: Arc<ConversationPipeline>,
    /// Conversation histories keyed by context id.
    pub contexts: Arc<ContextManager>,
    /// Live WebSocket connections.
    pub connection_manager: api_ws::ConnectionManager,
    /// Talking-head generator, when `[video]` is configured.
    pub video: Option<Arc<dyn VideoGenerator>>,
    /// Request body ceiling.
    pub max_body_bytes: usize,
}

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("engine setup failed: {0}")]
    Engine(#[from] EngineError),

    #[error("video setup failed: {0}")]
    Video(#[from] VoiceError),
}

impl AppState {
    pub fn new(
        pool: Arc<EnginePool>,
        pipeline: ConversationPipeline,
        contexts: Arc<ContextManager>,
    ) -> Self {
        Self {
            pool,
            pipeline: Arc::new(pipeline),
            contexts,
            connection_manager: api_ws::ConnectionManager::new(),
            video: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_video(mut self, video: Arc<dyn VideoGenerator>) -> Self {
        self.video = Some(video);
        self
    }

    /// Registers the built-in engines, resolves the configured pipeline and
    /// opens the audio cache. Unknown engine names and missing keys fail
    /// here rather than on the first request.
    pub async fn build(config: &Config) -> Result<Self, StartupError> {
        let mut registries = EngineRegistries::new();
        dh_voice::register_builtin(&mut registries)?;
        let pool = Arc::new(EnginePool::new(
            Arc::new(registries),
            config.engines.catalog(),
        ));

        let mut pipeline = ConversationPipeline::from_pool(&config.pipeline, &pool)
            .await?
            .with_retry(config.retry.policy());
        if config.cache.enabled {
            let cache = AudioCache::open(&config.cache.dir, config.cache.ttl()).await?;
            tracing::info!(dir = %cache.dir().display(), ttl_secs = config.cache.ttl_secs, "audio cache enabled");
            pipeline = pipeline.with_cache(cache);
        }

        let contexts = Arc::new(ContextManager::new(config.contexts.max_contexts));
        let mut state = Self::new(pool, pipeline, contexts);
        state.max_body_bytes = config.server.max_body_bytes;

        if let Some(settings) = &config.video {
            let generator = EchoMimicGenerator::new(settings.clone()).await?;
            tracing::info!(path = %settings.echomimic_path.display(), "video generation enabled");
            state = state.with_video(Arc::new(generator));
        }
        Ok(state)
    }
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .route("/api/health", get(api::health_handler))
        .route("/api/engines", get(api::engines_handler))
        .route("/api/audio_chat", post(api::audio_chat_handler))
        .route("/api/text_chat", post(api::text_chat_handler))
        .route("/api/asr", post(api::asr_handler))
        .route("/api/tts", post(api::tts_handler))
        .route("/api/agent", post(api::agent_handler))
        .route(
            "/api/contexts/{contextId}",
            get(api::get_context_handler).delete(api::delete_context_handler),
        )
        .route("/api/video/generate", post(api::generate_video_handler))
        .route("/api/text_to_video", post(api::text_to_video_handler))
        .route("/api/echomimic/pose_dirs", get(api::pose_dirs_handler))
        .route("/api/echomimic/ref_images", get(api::ref_images_handler))
        .route("/ws", get(api_ws::ws_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
