//! WebSocket API handler and connection management.

use crate::api::{record_turn, AudioPayload};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, Query, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use dh_engine::{AsrOptions, EngineError, EngineKind, EnginePool, TtsOptions};
use dh_pipeline::{ConversationPipeline, ProcessRequest, StageOverrides, TranscriptionSession};
use dh_types::{AudioFormat, AudioMessage};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Sample rate assumed for streamed audio when the client names none.
const DEFAULT_STREAM_SAMPLE_RATE: u32 = 16000;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// Stable id chosen by the client; a fresh one is assigned otherwise.
    pub client_id: Option<String>,
    /// Conversation to resume.
    pub context_id: Option<String>,
}

/// User-adjustable settings for one connection. Every field is optional so
/// a `config` message can update a subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_agent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asr_engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts_engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_engine: Option<String>,
    /// Reference portrait for video generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_image_path: Option<String>,
}

impl ConnectionSettings {
    /// `patch` fields that are set replace the current ones.
    pub fn merged(&self, patch: ConnectionSettings) -> Self {
        Self {
            language: patch.language.or_else(|| self.language.clone()),
            voice_id: patch.voice_id.or_else(|| self.voice_id.clone()),
            speed: patch.speed.or(self.speed),
            use_agent: patch.use_agent.or(self.use_agent),
            asr_engine: patch.asr_engine.or_else(|| self.asr_engine.clone()),
            llm_engine: patch.llm_engine.or_else(|| self.llm_engine.clone()),
            tts_engine: patch.tts_engine.or_else(|| self.tts_engine.clone()),
            agent_engine: patch.agent_engine.or_else(|| self.agent_engine.clone()),
            ref_image_path: patch.ref_image_path.or_else(|| self.ref_image_path.clone()),
        }
    }

    pub fn overrides(&self) -> StageOverrides {
        StageOverrides {
            asr: self.asr_engine.clone(),
            llm: self.llm_engine.clone(),
            tts: self.tts_engine.clone(),
            agent: self.agent_engine.clone(),
        }
    }

    fn asr_options(&self) -> AsrOptions {
        AsrOptions {
            language: self.language.clone(),
        }
    }

    fn tts_options(&self) -> TtsOptions {
        TtsOptions {
            voice_id: self.voice_id.clone(),
            speed: self.speed,
        }
    }
}

/// Incoming WebSocket message types.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    TextInput {
        text: String,
    },
    Config {
        #[serde(default)]
        config: ConnectionSettings,
    },
    Ping,
    RecordingStarted {
        #[serde(default)]
        audio_format: Option<String>,
        #[serde(default)]
        sample_rate: Option<u32>,
        #[serde(default)]
        sample_width: Option<u16>,
    },
    RecordingStopped,
    StopTalking,
}

/// Reply to one conversational turn.
#[derive(Debug, Serialize)]
pub struct ResponsePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_text: Option<String>,
    pub response_text: String,
    #[serde(flatten)]
    pub audio: Option<AudioPayload>,
}

/// Outgoing WebSocket message types.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Connected {
        connection_id: String,
        context_id: String,
    },
    Pong,
    ConfigUpdated {
        config: ConnectionSettings,
    },
    RecordingStarted,
    RecordingStopped,
    Transcription {
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },
    Response(ResponsePayload),
    Error {
        message: String,
    },
}

/// What starts a conversational turn.
#[derive(Debug)]
pub enum TurnInput {
    Text(String),
    Audio(AudioMessage),
}

/// Per-connection record. Engines come from the shared pool and are not
/// released here.
struct Connection {
    session_id: Uuid,
    sender: mpsc::Sender<String>,
    context_id: String,
    settings: ConnectionSettings,
    pipeline: Arc<ConversationPipeline>,
    transcription: Option<Box<dyn TranscriptionSession>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Everything a turn needs, copied out of the connection record.
#[derive(Clone)]
pub struct TurnSetup {
    pub pipeline: Arc<ConversationPipeline>,
    pub context_id: String,
    pub settings: ConnectionSettings,
}

/// Manages active WebSocket connections and their resources.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<RwLock<HashMap<String, Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a connection, replacing (and tearing down) any previous
    /// connection with the same id.
    ///
    /// Returns the session id that must accompany [`disconnect_session`].
    ///
    /// [`disconnect_session`]: ConnectionManager::disconnect_session
    pub async fn connect(
        &self,
        connection_id: String,
        context_id: String,
        sender: mpsc::Sender<String>,
        pipeline: Arc<ConversationPipeline>,
    ) -> Uuid {
        if self.contains(&connection_id).await {
            let errors = self.disconnect(&connection_id).await;
            tracing::info!(
                connection_id = %connection_id,
                cleanup_errors = errors.len(),
                "replaced existing WebSocket connection"
            );
        }

        let session_id = Uuid::new_v4();
        self.connections.write().await.insert(
            connection_id,
            Connection {
                session_id,
                sender,
                context_id,
                settings: ConnectionSettings::default(),
                pipeline,
                transcription: None,
                tasks: Vec::new(),
            },
        );
        session_id
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Releases every resource of the connection and removes its record.
    ///
    /// Every step runs even when an earlier one fails; failures are logged
    /// and returned. Unknown ids are a no-op.
    pub async fn disconnect(&self, connection_id: &str) -> Vec<String> {
        let removed = self.connections.write().await.remove(connection_id);
        match removed {
            Some(connection) => release_connection(connection_id, connection).await,
            None => Vec::new(),
        }
    }

    /// Like [`disconnect`](ConnectionManager::disconnect), but only when the
    /// record still belongs to `session_id`. A socket replaced by a newer one
    /// with the same id must not tear the newer one down.
    pub async fn disconnect_session(&self, connection_id: &str, session_id: Uuid) -> Vec<String> {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(connection_id) {
                Some(current) if current.session_id == session_id => {
                    connections.remove(connection_id)
                }
                _ => None,
            }
        };
        match removed {
            Some(connection) => release_connection(connection_id, connection).await,
            None => Vec::new(),
        }
    }

    /// Serializes and queues a message for one connection.
    pub async fn send(&self, connection_id: &str, message: &OutgoingMessage) {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize WebSocket message: {}", e);
                return;
            }
        };
        let connections = self.connections.read().await;
        if let Some(connection) = connections.get(connection_id) {
            if let Err(e) = connection.sender.try_send(json) {
                tracing::warn!(
                    connection_id = %connection_id,
                    "dropping message for slow consumer: {}",
                    e
                );
            }
        }
    }

    pub async fn send_error(&self, connection_id: &str, message: impl Into<String>) {
        self.send(
            connection_id,
            &OutgoingMessage::Error {
                message: message.into(),
            },
        )
        .await;
    }

    pub async fn settings(&self, connection_id: &str) -> Option<ConnectionSettings> {
        let connections = self.connections.read().await;
        connections.get(connection_id).map(|c| c.settings.clone())
    }

    pub async fn turn_setup(&self, connection_id: &str) -> Option<TurnSetup> {
        let connections = self.connections.read().await;
        connections.get(connection_id).map(|c| TurnSetup {
            pipeline: c.pipeline.clone(),
            context_id: c.context_id.clone(),
            settings: c.settings.clone(),
        })
    }

    /// Applies a settings patch. Engine choices are resolved through `pool`
    /// on top of `base`; an unknown engine leaves the settings unchanged.
    pub async fn update_settings(
        &self,
        connection_id: &str,
        patch: ConnectionSettings,
        pool: &EnginePool,
        base: &ConversationPipeline,
    ) -> Result<ConnectionSettings, EngineError> {
        let current = self
            .settings(connection_id)
            .await
            .ok_or_else(|| EngineError::Internal(format!("unknown connection {connection_id}")))?;
        let merged = current.merged(patch);
        let overrides = merged.overrides();
        let pipeline = if overrides.is_empty() {
            base.clone()
        } else {
            base.with_overrides(pool, &overrides).await?
        };

        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get_mut(connection_id) {
            connection.settings = merged.clone();
            connection.pipeline = Arc::new(pipeline);
        }
        tracing::info!(connection_id = %connection_id, settings = ?merged, "connection settings updated");
        Ok(merged)
    }

    /// Opens a transcription session for streamed audio, replacing any
    /// session already open.
    pub async fn start_recording(
        &self,
        connection_id: &str,
        format: AudioFormat,
        sample_rate: u32,
        sample_width: u16,
    ) -> Result<(), EngineError> {
        if sample_rate == 0 || sample_width == 0 {
            return Err(EngineError::InvalidInput(
                "sample_rate and sample_width must be positive".to_string(),
            ));
        }
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(connection_id)
            .ok_or_else(|| EngineError::Internal(format!("unknown connection {connection_id}")))?;
        let session = connection
            .pipeline
            .transcription_session(
                format,
                sample_rate,
                sample_width,
                &connection.settings.asr_options(),
            )
            .ok_or(EngineError::NotConfigured(EngineKind::Asr))?;
        if let Some(mut previous) = connection.transcription.replace(Box::new(session)) {
            previous.close().await;
        }
        Ok(())
    }

    /// Buffers a binary frame in the open transcription session. Returns
    /// `false` when no session is open.
    pub async fn push_audio(&self, connection_id: &str, chunk: &[u8]) -> Result<bool, EngineError> {
        let mut connections = self.connections.write().await;
        let Some(session) = connections
            .get_mut(connection_id)
            .and_then(|c| c.transcription.as_mut())
        else {
            return Ok(false);
        };
        session.push(chunk).await?;
        Ok(true)
    }

    /// Detaches the open transcription session so it can be finished
    /// without holding the connection map.
    pub async fn take_recording(&self, connection_id: &str) -> Option<Box<dyn TranscriptionSession>> {
        let mut connections = self.connections.write().await;
        connections
            .get_mut(connection_id)
            .and_then(|c| c.transcription.take())
    }

    /// Attaches a background task to the connection so that `stop_talking`
    /// and disconnect can abort it. A task for a departed connection is
    /// aborted immediately.
    pub async fn track_task(&self, connection_id: &str, task: JoinHandle<()>) {
        let mut connections = self.connections.write().await;
        match connections.get_mut(connection_id) {
            Some(connection) => {
                connection.tasks.retain(|t| !t.is_finished());
                connection.tasks.push(task);
            }
            None => task.abort(),
        }
    }

    /// Aborts every in-flight turn of the connection. Returns how many were
    /// still running.
    pub async fn stop_tasks(&self, connection_id: &str) -> usize {
        let tasks = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(connection_id) {
                Some(connection) => std::mem::take(&mut connection.tasks),
                None => return 0,
            }
        };
        let mut stopped = 0;
        for task in tasks {
            if !task.is_finished() {
                task.abort();
                stopped += 1;
            }
        }
        stopped
    }
}

async fn release_connection(connection_id: &str, mut connection: Connection) -> Vec<String> {
    let mut errors = Vec::new();

    for task in &connection.tasks {
        task.abort();
    }
    for task in connection.tasks.drain(..) {
        if let Err(e) = task.await {
            if e.is_panic() {
                errors.push(format!("background task panicked: {e}"));
            }
        }
    }

    if let Some(mut session) = connection.transcription.take() {
        session.close().await;
    }

    for error in &errors {
        tracing::warn!(connection_id = %connection_id, "connection cleanup: {}", error);
    }
    tracing::info!(
        connection_id = %connection_id,
        errors = errors.len(),
        "WebSocket connection released"
    );
    errors
}

/// WebSocket handler: `GET /ws?client_id=...&context_id=...`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let connection_id = params
        .client_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::info!(connection_id = %connection_id, remote_addr = %addr, "websocket connect");

    ws.on_upgrade(move |socket| handle_socket(socket, state, connection_id, params.context_id))
}

/// Handles the WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    connection_id: String,
    context_id: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Bounded so a slow consumer cannot grow memory without limit.
    let (tx, mut rx) = mpsc::channel::<String>(256);

    let (context_id, _) = state.contexts.get_context(context_id.as_deref()).await;
    let session_id = state
        .connection_manager
        .connect(
            connection_id.clone(),
            context_id.clone(),
            tx,
            state.pipeline.clone(),
        )
        .await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    state
        .connection_manager
        .send(
            &connection_id,
            &OutgoingMessage::Connected {
                connection_id: connection_id.clone(),
                context_id,
            },
        )
        .await;

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            AxumMessage::Text(text) => handle_text_frame(&state, &connection_id, text.as_str()).await,
            AxumMessage::Binary(data) => handle_audio_frame(&state, &connection_id, &data).await,
            AxumMessage::Close(_) => break,
            _ => {}
        }
    }

    state
        .connection_manager
        .disconnect_session(&connection_id, session_id)
        .await;
    send_task.abort();
}

async fn handle_text_frame(state: &Arc<AppState>, connection_id: &str, text: &str) {
    let manager = &state.connection_manager;
    let message: IncomingMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(connection_id = %connection_id, "unparseable frame: {}", e);
            manager
                .send_error(connection_id, format!("invalid message: {e}"))
                .await;
            return;
        }
    };

    match message {
        IncomingMessage::TextInput { text } => {
            let text = text.trim();
            if text.is_empty() {
                return;
            }
            spawn_turn(state, connection_id, TurnInput::Text(text.to_string())).await;
        }
        IncomingMessage::Config { config } => {
            match manager
                .update_settings(connection_id, config, &state.pool, &state.pipeline)
                .await
            {
                Ok(settings) => {
                    manager
                        .send(connection_id, &OutgoingMessage::ConfigUpdated { config: settings })
                        .await
                }
                Err(e) => manager.send_error(connection_id, e.to_string()).await,
            }
        }
        IncomingMessage::Ping => manager.send(connection_id, &OutgoingMessage::Pong).await,
        IncomingMessage::RecordingStarted {
            audio_format,
            sample_rate,
            sample_width,
        } => {
            let format = match audio_format.as_deref().map(str::parse::<AudioFormat>) {
                None => AudioFormat::Webm,
                Some(Ok(format)) => format,
                Some(Err(e)) => {
                    manager.send_error(connection_id, e.to_string()).await;
                    return;
                }
            };
            let started = manager
                .start_recording(
                    connection_id,
                    format,
                    sample_rate.unwrap_or(DEFAULT_STREAM_SAMPLE_RATE),
                    sample_width.unwrap_or(2),
                )
                .await;
            match started {
                Ok(()) => {
                    manager
                        .send(connection_id, &OutgoingMessage::RecordingStarted)
                        .await
                }
                Err(e) => manager.send_error(connection_id, e.to_string()).await,
            }
        }
        IncomingMessage::RecordingStopped => match manager.take_recording(connection_id).await {
            Some(session) => {
                manager
                    .send(connection_id, &OutgoingMessage::RecordingStopped)
                    .await;
                let task = tokio::spawn(transcribe_and_reply(
                    state.clone(),
                    connection_id.to_string(),
                    session,
                ));
                manager.track_task(connection_id, task).await;
            }
            None => {
                manager
                    .send_error(connection_id, "no recording in progress")
                    .await
            }
        },
        IncomingMessage::StopTalking => {
            let stopped = manager.stop_tasks(connection_id).await;
            tracing::info!(connection_id = %connection_id, stopped, "stop talking");
        }
    }
}

/// Binary frames feed the open recording; without one, each frame is a
/// complete utterance.
async fn handle_audio_frame(state: &Arc<AppState>, connection_id: &str, data: &[u8]) {
    let manager = &state.connection_manager;
    match manager.push_audio(connection_id, data).await {
        Ok(true) => {}
        Ok(false) => {
            let format = AudioFormat::detect(data).unwrap_or(AudioFormat::Webm);
            let audio = AudioMessage::new(data.to_vec(), format, DEFAULT_STREAM_SAMPLE_RATE, 2);
            spawn_turn(state, connection_id, TurnInput::Audio(audio)).await;
        }
        Err(e) => manager.send_error(connection_id, e.to_string()).await,
    }
}

async fn spawn_turn(state: &Arc<AppState>, connection_id: &str, input: TurnInput) {
    let task = tokio::spawn(run_turn(state.clone(), connection_id.to_string(), input));
    state
        .connection_manager
        .track_task(connection_id, task)
        .await;
}

async fn transcribe_and_reply(
    state: Arc<AppState>,
    connection_id: String,
    mut session: Box<dyn TranscriptionSession>,
) {
    let manager = &state.connection_manager;
    let transcript = session.finish().await;
    session.close().await;

    match transcript {
        Ok(Some(message)) => {
            let Some(text) = message.text().map(str::to_string) else {
                return;
            };
            manager
                .send(
                    &connection_id,
                    &OutgoingMessage::Transcription {
                        text: text.clone(),
                        is_final: true,
                    },
                )
                .await;
            run_turn(state.clone(), connection_id.clone(), TurnInput::Text(text)).await;
        }
        Ok(None) => tracing::debug!(connection_id = %connection_id, "recording contained no speech"),
        Err(e) => {
            tracing::error!(connection_id = %connection_id, stage = "asr", "transcription failed: {}", e);
            manager
                .send_error(&connection_id, format!("speech recognition failed: {e}"))
                .await;
        }
    }
}

/// Runs one turn for a connection and replies with a `response` frame.
/// The context lock is held for the whole turn.
pub async fn run_turn(state: Arc<AppState>, connection_id: String, input: TurnInput) {
    let manager = &state.connection_manager;
    let Some(setup) = manager.turn_setup(&connection_id).await else {
        return;
    };

    let (_, handle) = state.contexts.get_context(Some(setup.context_id.as_str())).await;
    let mut context = handle.lock().await;
    let (audio, text_input) = match input {
        TurnInput::Text(text) => (None, Some(text)),
        TurnInput::Audio(audio) => (Some(audio), None),
    };
    let request = ProcessRequest {
        audio,
        text_input,
        history: context.messages().to_vec(),
        agent_context: context.agent_context.clone(),
        use_agent: setup.settings.use_agent,
        asr_options: setup.settings.asr_options(),
        tts_options: setup.settings.tts_options(),
        session_id: Some(connection_id.clone()),
        ..ProcessRequest::default()
    };
    let result = setup.pipeline.process(request).await;

    if let Some(error) = result.error.clone() {
        drop(context);
        manager.send_error(&connection_id, error).await;
        return;
    }
    let Some(input_text) = result.input_text().map(str::to_string) else {
        return;
    };
    let response_text = result.response_text().unwrap_or_default().to_string();
    record_turn(&mut context, &input_text, &response_text);
    drop(context);

    let payload = ResponsePayload {
        input_text: Some(input_text),
        response_text,
        audio: result.audio().map(AudioPayload::from),
    };
    manager
        .send(&connection_id, &OutgoingMessage::Response(payload))
        .await;
}
