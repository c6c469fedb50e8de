//! REST handlers.

use crate::AppState;
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dh_engine::{AgentRequestContext, AsrOptions, EngineError, EngineKind, TtsOptions};
use dh_pipeline::{merge_agent_context, ContextSnapshot, ConversationContext, FailureKind, ProcessRequest};
use dh_types::{AudioFormat, AudioMessage, ChatTurn, TextMessage};
use dh_voice::VoiceError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

fn default_audio_format() -> String {
    "wav".to_string()
}

fn default_video_audio_format() -> String {
    "mp3".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_sample_width() -> u16 {
    2
}

/// Request body for `POST /api/audio_chat`.
#[derive(Debug, Deserialize)]
pub struct AudioChatRequest {
    /// Base64-encoded audio.
    pub audio_data: String,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_sample_width")]
    pub sample_width: u16,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub skip_asr: bool,
    #[serde(default)]
    pub skip_llm: bool,
    #[serde(default)]
    pub skip_tts: bool,
}

/// Request body for `POST /api/text_chat`.
#[derive(Debug, Deserialize)]
pub struct TextChatRequest {
    pub text: String,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub skip_tts: bool,
}

/// Request body for `POST /api/asr`.
#[derive(Debug, Deserialize)]
pub struct AsrRequest {
    pub audio_data: String,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_sample_width")]
    pub sample_width: u16,
    #[serde(default)]
    pub language: Option<String>,
}

/// Request body for `POST /api/tts`.
#[derive(Debug, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
}

/// Request body for `POST /api/agent`.
#[derive(Debug, Deserialize)]
pub struct AgentRequest {
    pub query: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub use_tools: Option<bool>,
    /// Extra context merged over the stored conversation context.
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

/// Request body for `POST /api/video/generate`.
#[derive(Debug, Deserialize)]
pub struct VideoGenerationRequest {
    pub audio_data: String,
    #[serde(default = "default_video_audio_format")]
    pub audio_format: String,
    #[serde(default)]
    pub ref_image_path: Option<String>,
}

/// Request body for `POST /api/text_to_video`.
#[derive(Debug, Deserialize)]
pub struct TextToVideoRequest {
    pub text: String,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub ref_image_path: Option<String>,
}

/// Synthesized audio as it appears in responses.
#[derive(Debug, Serialize)]
pub struct AudioPayload {
    /// Base64-encoded audio.
    pub audio_data: String,
    pub audio_format: AudioFormat,
    pub sample_rate: u32,
    pub sample_width: u16,
}

impl From<&AudioMessage> for AudioPayload {
    fn from(audio: &AudioMessage) -> Self {
        Self {
            audio_data: STANDARD.encode(&audio.data),
            audio_format: audio.format,
            sample_rate: audio.sample_rate,
            sample_width: audio.sample_width,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AudioChatResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_text: Option<String>,
    pub response_text: String,
    #[serde(flatten)]
    pub audio: Option<AudioPayload>,
    pub context_id: String,
    pub took_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct TextChatResponse {
    pub response_text: String,
    #[serde(flatten)]
    pub audio: Option<AudioPayload>,
    pub context_id: String,
    pub took_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct AsrResponse {
    pub text: String,
    pub took_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct TtsResponse {
    #[serde(flatten)]
    pub audio: AudioPayload,
    /// Whether the audio was served from the synthesis cache.
    pub from_cache: bool,
    pub took_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub text: String,
    pub conversation_id: String,
    pub took_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub tools_used: Vec<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct VideoGenerationResponse {
    pub video_path: String,
    pub took_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct PoseDirsResponse {
    pub pose_dirs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RefImagesResponse {
    pub ref_images: Vec<String>,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl ApiError {
    /// Maps a pipeline failure onto a status class.
    pub fn from_failure(kind: Option<FailureKind>, message: String) -> Self {
        match kind {
            Some(FailureKind::InvalidInput) => Self::BadRequest(message),
            Some(FailureKind::Configuration) => Self::Unavailable(message),
            Some(FailureKind::Engine) | None => Self::InternalServerError(message),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidInput(msg) => Self::BadRequest(msg),
            e if e.is_configuration() => Self::Unavailable(e.to_string()),
            e => Self::InternalServerError(e.to_string()),
        }
    }
}

impl From<VoiceError> for ApiError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::NotFound(_) | VoiceError::Config(_) | VoiceError::InputTooLarge { .. } => {
                Self::BadRequest(err.to_string())
            }
            e => Self::InternalServerError(format!("video generation failed: {e}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "request failed: {}", message);
        }

        (status, Json(json!({ "detail": message }))).into_response()
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Decodes a base64 audio field. Empty audio and zero sample parameters are
/// caller errors.
pub(crate) fn decode_audio(
    data: &str,
    format: &str,
    sample_rate: u32,
    sample_width: u16,
) -> Result<AudioMessage, ApiError> {
    if sample_rate == 0 {
        return Err(ApiError::BadRequest("sample_rate must be positive".to_string()));
    }
    if sample_width == 0 {
        return Err(ApiError::BadRequest("sample_width must be positive".to_string()));
    }
    let format: AudioFormat = format
        .parse()
        .map_err(|e: dh_types::UnsupportedFormat| ApiError::BadRequest(e.to_string()))?;
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| ApiError::BadRequest(format!("audio_data is not valid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("audio_data is empty".to_string()));
    }
    Ok(AudioMessage::new(bytes, format, sample_rate, sample_width))
}

fn required_text(value: &str, field: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("{field} is empty")));
    }
    Ok(trimmed.to_string())
}

/// Appends one exchange to the context history.
pub(crate) fn record_turn(context: &mut ConversationContext, input: &str, response: &str) {
    context.append(ChatTurn::user(input));
    if !response.is_empty() {
        context.append(ChatTurn::assistant(response));
    }
}

/// Handler for `GET /api/health`.
pub async fn health_handler() -> Json<Value> {
    let now = chrono::Utc::now();
    Json(json!({
        "status": "ok",
        "timestamp": now.timestamp_millis() as f64 / 1000.0,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Handler for `GET /api/engines`: registered names per kind and the
/// instances built so far.
pub async fn engines_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let registries = state.pool.registries();
    let mut body = Map::new();
    for kind in EngineKind::ALL {
        body.insert(kind.as_str().to_string(), json!(registries.available(kind)));
    }
    let initialized: Vec<Value> = state
        .pool
        .initialized()
        .await
        .into_iter()
        .map(|(kind, name)| json!({ "kind": kind, "name": name }))
        .collect();
    body.insert("initialized".to_string(), Value::Array(initialized));
    body.insert(
        "video".to_string(),
        Value::Bool(state.video.is_some()),
    );
    Json(Value::Object(body))
}

/// Handler for `POST /api/audio_chat`.
pub async fn audio_chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<AudioChatRequest>,
) -> Result<Json<AudioChatResponse>, ApiError> {
    let started = Instant::now();
    let audio = decode_audio(
        &payload.audio_data,
        &payload.audio_format,
        payload.sample_rate,
        payload.sample_width,
    )?;

    let (context_id, handle) = state
        .contexts
        .get_context(payload.context_id.as_deref())
        .await;
    let mut context = handle.lock().await;
    let request = ProcessRequest {
        audio: Some(audio),
        history: context.messages().to_vec(),
        agent_context: context.agent_context.clone(),
        skip_asr: payload.skip_asr,
        skip_llm: payload.skip_llm,
        skip_tts: payload.skip_tts,
        session_id: Some(context_id.clone()),
        ..ProcessRequest::default()
    };
    let result = state.pipeline.process(request).await;
    if let Some(error) = result.error.clone() {
        return Err(ApiError::from_failure(result.failure, error));
    }

    let input_text = result.input_text().map(str::to_string);
    let response_text = result.response_text().unwrap_or_default().to_string();
    if let Some(input) = &input_text {
        record_turn(&mut context, input, &response_text);
    }
    drop(context);

    Ok(Json(AudioChatResponse {
        input_text,
        response_text,
        audio: result.audio().map(AudioPayload::from),
        context_id,
        took_ms: elapsed_ms(started),
    }))
}

/// Handler for `POST /api/text_chat`.
///
/// The whole turn runs under the context lock, so concurrent requests on
/// one context are applied one after the other.
pub async fn text_chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<TextChatRequest>,
) -> Result<Json<TextChatResponse>, ApiError> {
    let started = Instant::now();
    let text = required_text(&payload.text, "text")?;

    let (context_id, handle) = state
        .contexts
        .get_context(payload.context_id.as_deref())
        .await;
    let mut context = handle.lock().await;
    let request = ProcessRequest {
        text_input: Some(text.clone()),
        history: context.messages().to_vec(),
        agent_context: context.agent_context.clone(),
        skip_tts: payload.skip_tts,
        session_id: Some(context_id.clone()),
        ..ProcessRequest::default()
    };
    let result = state.pipeline.process(request).await;
    if let Some(error) = result.error.clone() {
        return Err(ApiError::from_failure(result.failure, error));
    }
    let Some(response_text) = result.response_text().map(str::to_string) else {
        return Err(ApiError::InternalServerError(
            "language model returned no reply".to_string(),
        ));
    };

    record_turn(&mut context, &text, &response_text);
    drop(context);

    Ok(Json(TextChatResponse {
        response_text,
        audio: result.audio().map(AudioPayload::from),
        context_id,
        took_ms: elapsed_ms(started),
    }))
}

/// Handler for `POST /api/asr`. Silence yields an empty `text`.
pub async fn asr_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<AsrRequest>,
) -> Result<Json<AsrResponse>, ApiError> {
    let started = Instant::now();
    let audio = decode_audio(
        &payload.audio_data,
        &payload.audio_format,
        payload.sample_rate,
        payload.sample_width,
    )?;
    let options = AsrOptions {
        language: payload.language,
    };

    let text = state
        .pipeline
        .transcribe(&audio, &options)
        .await?
        .and_then(|message| message.data)
        .unwrap_or_default();

    Ok(Json(AsrResponse {
        text,
        took_ms: elapsed_ms(started),
    }))
}

/// Handler for `POST /api/tts`.
pub async fn tts_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<TtsRequest>,
) -> Result<Json<TtsResponse>, ApiError> {
    let started = Instant::now();
    let text = required_text(&payload.text, "text")?;
    let options = TtsOptions {
        voice_id: payload.voice_id,
        speed: payload.speed,
    };

    let synthesis = state
        .pipeline
        .synthesize(&text, &options)
        .await?
        .ok_or_else(|| {
            ApiError::InternalServerError("speech synthesis produced no audio".to_string())
        })?;

    Ok(Json(TtsResponse {
        audio: AudioPayload::from(&synthesis.audio),
        from_cache: synthesis.from_cache,
        took_ms: elapsed_ms(started),
    }))
}

/// Handler for `POST /api/agent`.
pub async fn agent_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<AgentRequest>,
) -> Result<Json<AgentResponse>, ApiError> {
    let started = Instant::now();
    if !state.pipeline.has_agent() {
        return Err(ApiError::Unavailable("Agent engine not initialized".to_string()));
    }
    let query = required_text(&payload.query, "query")?;

    let (conversation_id, handle) = state
        .contexts
        .get_context(payload.conversation_id.as_deref())
        .await;
    let mut context = handle.lock().await;
    let extra = payload.context.unwrap_or_default();
    let request = AgentRequestContext {
        context: merge_agent_context(&context.agent_context, &extra),
        history: context.messages().to_vec(),
        use_tools: payload.use_tools.unwrap_or(true),
    };
    tracing::info!(conversation_id = %conversation_id, use_tools = request.use_tools, "agent query");

    let input = TextMessage::new(query.as_str()).with_desc("user");
    let reply = state
        .pipeline
        .run_agent(&input, &request)
        .await?
        .filter(|reply| reply.text().is_some())
        .ok_or_else(|| ApiError::InternalServerError("agent returned no reply".to_string()))?;
    let text = reply.text().unwrap_or_default().to_string();

    context.agent_context = merge_agent_context(&context.agent_context, &extra);
    context
        .agent_context
        .insert("last_query".to_string(), Value::String(query.clone()));
    context
        .agent_context
        .insert("last_response".to_string(), Value::String(text.clone()));
    record_turn(&mut context, &query, &text);
    drop(context);

    Ok(Json(AgentResponse {
        text,
        conversation_id,
        took_ms: elapsed_ms(started),
        run_id: reply.run_id,
        tools_used: reply.tools_used,
        metadata: reply.metadata,
    }))
}

/// Handler for `GET /api/contexts/{contextId}`.
pub async fn get_context_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(context_id): Path<String>,
) -> Result<Json<ContextSnapshot>, ApiError> {
    state
        .contexts
        .snapshot(&context_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("context {context_id}")))
}

/// Handler for `DELETE /api/contexts/{contextId}`.
pub async fn delete_context_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(context_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.contexts.remove(&context_id).await {
        tracing::info!(context_id = %context_id, "context deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("context {context_id}")))
    }
}

fn video_unavailable() -> ApiError {
    ApiError::Unavailable("video generation not configured".to_string())
}

/// Handler for `POST /api/video/generate`.
pub async fn generate_video_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<VideoGenerationRequest>,
) -> Result<Json<VideoGenerationResponse>, ApiError> {
    let started = Instant::now();
    let video = state.video.clone().ok_or_else(video_unavailable)?;
    let audio = decode_audio(
        &payload.audio_data,
        &payload.audio_format,
        default_sample_rate(),
        default_sample_width(),
    )?;

    let reference = payload.ref_image_path.as_deref().map(std::path::Path::new);
    let outcome = video.generate_from_audio(&audio, reference).await?;

    Ok(Json(VideoGenerationResponse {
        video_path: outcome.video_path.display().to_string(),
        took_ms: elapsed_ms(started),
    }))
}

/// Handler for `POST /api/text_to_video`: synthesizes `text`, then renders
/// it against the reference portrait.
pub async fn text_to_video_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<TextToVideoRequest>,
) -> Result<Json<VideoGenerationResponse>, ApiError> {
    let started = Instant::now();
    let video = state.video.clone().ok_or_else(video_unavailable)?;
    let text = required_text(&payload.text, "text")?;

    let options = TtsOptions {
        voice_id: payload.voice_id,
        speed: None,
    };
    let synthesis = state
        .pipeline
        .synthesize(&text, &options)
        .await?
        .ok_or_else(|| {
            ApiError::InternalServerError("speech synthesis produced no audio".to_string())
        })?;

    let reference = payload.ref_image_path.as_deref().map(std::path::Path::new);
    let outcome = video.generate_from_audio(&synthesis.audio, reference).await?;

    Ok(Json(VideoGenerationResponse {
        video_path: outcome.video_path.display().to_string(),
        took_ms: elapsed_ms(started),
    }))
}

fn display_paths(paths: Vec<std::path::PathBuf>) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

/// Handler for `GET /api/echomimic/pose_dirs`.
pub async fn pose_dirs_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<PoseDirsResponse>, ApiError> {
    let video = state.video.clone().ok_or_else(video_unavailable)?;
    let dirs = video.pose_dirs().await.map_err(|e| {
        ApiError::InternalServerError(format!("failed to list pose directories: {e}"))
    })?;
    Ok(Json(PoseDirsResponse {
        pose_dirs: display_paths(dirs),
    }))
}

/// Handler for `GET /api/echomimic/ref_images`.
pub async fn ref_images_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<RefImagesResponse>, ApiError> {
    let video = state.video.clone().ok_or_else(video_unavailable)?;
    let images = video.reference_images().await.map_err(|e| {
        ApiError::InternalServerError(format!("failed to list reference images: {e}"))
    })?;
    Ok(Json(RefImagesResponse {
        ref_images: display_paths(images),
    }))
}
