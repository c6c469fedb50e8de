#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use dh_engine::{
    AgentEngine, AgentRequestContext, AsrEngine, AsrOptions, AudioCache, Engine, EngineError,
    EngineKind, EnginePool, EngineRegistries, LlmEngine, RetryPolicy, TtsEngine, TtsOptions,
};
use dh_pipeline::{ContextManager, ConversationPipeline, PipelineSettings};
use dh_server::AppState;
use dh_types::{AgentReply, AudioFormat, AudioMessage, ChatTurn, TextMessage};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Hears "hello there" in any audio except silence, which is empty or
/// all-zero audio.
pub struct FixedAsr;

#[async_trait]
impl Engine for FixedAsr {
    fn name(&self) -> &str {
        "fixed-asr"
    }
    fn kind(&self) -> EngineKind {
        EngineKind::Asr
    }
}

#[async_trait]
impl AsrEngine for FixedAsr {
    async fn run(
        &self,
        input: &[AudioMessage],
        _options: &AsrOptions,
    ) -> Result<Option<TextMessage>, EngineError> {
        if input
            .iter()
            .all(|audio| audio.data.iter().all(|byte| *byte == 0))
        {
            return Ok(None);
        }
        Ok(Some(TextMessage::new("hello there")))
    }
}

/// Replies `echo: <input>`; sleeps briefly so concurrent turns overlap.
#[derive(Default)]
pub struct EchoLlm {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Engine for EchoLlm {
    fn name(&self) -> &str {
        "echo"
    }
    fn kind(&self) -> EngineKind {
        EngineKind::Llm
    }
}

#[async_trait]
impl LlmEngine for EchoLlm {
    async fn run(
        &self,
        input: &[TextMessage],
        _history: &[ChatTurn],
    ) -> Result<Option<TextMessage>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let text = input[0].text().unwrap_or_default();
        Ok(Some(TextMessage::new(format!("echo: {text}"))))
    }
}

pub struct ToolAgent;

#[async_trait]
impl Engine for ToolAgent {
    fn name(&self) -> &str {
        "tool-agent"
    }
    fn kind(&self) -> EngineKind {
        EngineKind::Agent
    }
}

#[async_trait]
impl AgentEngine for ToolAgent {
    async fn run(
        &self,
        input: &TextMessage,
        request: &AgentRequestContext,
    ) -> Result<Option<AgentReply>, EngineError> {
        let tools_used = if request.use_tools {
            vec!["search".to_string()]
        } else {
            vec![]
        };
        let mut metadata = Map::new();
        metadata.insert(
            "context_keys".to_string(),
            Value::from(request.context.len() as u64),
        );
        metadata.insert(
            "history_len".to_string(),
            Value::from(request.history.len() as u64),
        );
        Ok(Some(AgentReply {
            message: TextMessage::new(format!("agent: {}", input.text().unwrap_or_default())),
            run_id: Some("run-42".into()),
            tools_used,
            metadata,
        }))
    }
}

/// Audio bytes are `<voice>|<text>` so tests can see what was synthesized.
pub struct BytesTts {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Engine for BytesTts {
    fn name(&self) -> &str {
        "bytes"
    }
    fn kind(&self) -> EngineKind {
        EngineKind::Tts
    }
}

#[async_trait]
impl TtsEngine for BytesTts {
    async fn run(
        &self,
        input: &[TextMessage],
        options: &TtsOptions,
    ) -> Result<Option<AudioMessage>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let voice = options.voice_id.as_deref().unwrap_or("default");
        let text = input[0].text().unwrap_or_default();
        let data = format!("{voice}|{text}").into_bytes();
        Ok(Some(AudioMessage::new(data, AudioFormat::Mp3, 24000, 2)))
    }

    fn default_voice(&self) -> &str {
        "default"
    }
}

/// A pool whose registries hold the mock engines above. `tts_calls` counts
/// every synthesis across all instances.
pub fn mock_pool(tts_calls: Arc<AtomicUsize>) -> Arc<EnginePool> {
    let mut registries = EngineRegistries::new();
    registries
        .asr
        .register("fixed-asr", &[], |_| Ok(Arc::new(FixedAsr) as Arc<dyn AsrEngine>))
        .unwrap();
    registries
        .llm
        .register("echo", &[], |_| Ok(Arc::new(EchoLlm::default()) as Arc<dyn LlmEngine>))
        .unwrap();
    registries
        .agent
        .register("tool-agent", &[], |_| Ok(Arc::new(ToolAgent) as Arc<dyn AgentEngine>))
        .unwrap();
    registries
        .tts
        .register("bytes", &[], move |_| {
            Ok(Arc::new(BytesTts {
                calls: tts_calls.clone(),
            }) as Arc<dyn TtsEngine>)
        })
        .unwrap();
    registries
        .tts
        .register("keyed", &["api_key"], |_| {
            Ok(Arc::new(BytesTts {
                calls: Arc::new(AtomicUsize::new(0)),
            }) as Arc<dyn TtsEngine>)
        })
        .unwrap();
    Arc::new(EnginePool::new(Arc::new(registries), Vec::new()))
}

pub fn full_settings() -> PipelineSettings {
    PipelineSettings {
        asr: Some("fixed-asr".into()),
        llm: Some("echo".into()),
        tts: Some("bytes".into()),
        agent: None,
        use_agent: false,
        ..PipelineSettings::default()
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        multiplier: 2,
    }
}

pub struct Harness {
    pub state: AppState,
    pub tts_calls: Arc<AtomicUsize>,
}

pub async fn harness(settings: PipelineSettings, cache: Option<AudioCache>) -> Harness {
    let tts_calls = Arc::new(AtomicUsize::new(0));
    let pool = mock_pool(tts_calls.clone());
    let mut pipeline = ConversationPipeline::from_pool(&settings, &pool)
        .await
        .unwrap()
        .with_retry(fast_retry());
    if let Some(cache) = cache {
        pipeline = pipeline.with_cache(cache);
    }
    let state = AppState::new(pool, pipeline, Arc::new(ContextManager::new(None)));
    Harness { state, tts_calls }
}

pub async fn send_json(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

pub async fn send_empty(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}
