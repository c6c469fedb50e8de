use async_trait::async_trait;
use dh_engine::{
    AgentEngine, AgentRequestContext, AsrEngine, AsrOptions, AudioCache, Engine, EngineConfig,
    EngineError, EngineKind, EnginePool, EngineRegistries, LlmEngine, RetryPolicy, TtsEngine,
    TtsOptions,
};
use dh_pipeline::{
    ConversationPipeline, FailureKind, PipelineSettings, ProcessRequest, StageOverrides,
};
use dh_types::{AgentReply, AudioFormat, AudioMessage, ChatTurn, TextMessage};
use serde_json::{json, Map};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedAsr {
    transcript: Option<&'static str>,
    transient_failures: AtomicU32,
    calls: AtomicUsize,
    languages: Mutex<Vec<Option<String>>>,
}

impl ScriptedAsr {
    fn new(transcript: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            transcript,
            transient_failures: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            languages: Mutex::new(Vec::new()),
        })
    }

    fn failing_first(transcript: &'static str, failures: u32) -> Arc<Self> {
        let asr = Self::new(Some(transcript));
        asr.transient_failures.store(failures, Ordering::SeqCst);
        asr
    }
}

#[async_trait]
impl Engine for ScriptedAsr {
    fn name(&self) -> &str {
        "scripted"
    }
    fn kind(&self) -> EngineKind {
        EngineKind::Asr
    }
}

#[async_trait]
impl AsrEngine for ScriptedAsr {
    async fn run(
        &self,
        _input: &[AudioMessage],
        options: &AsrOptions,
    ) -> Result<Option<TextMessage>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.languages.lock().unwrap().push(options.language.clone());
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::Transport("connection reset".into()));
        }
        Ok(self.transcript.map(TextMessage::new))
    }
}

#[derive(Default)]
struct EchoLlm {
    calls: AtomicUsize,
    history_lens: Mutex<Vec<usize>>,
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
        history: &[ChatTurn],
    ) -> Result<Option<TextMessage>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history_lens.lock().unwrap().push(history.len());
        let text = input[0].text().unwrap_or_default();
        Ok(Some(TextMessage::new(format!("echo: {text}"))))
    }
}

#[derive(Default)]
struct FixedAgent {
    calls: AtomicUsize,
    contexts: Mutex<Vec<AgentRequestContext>>,
}

#[async_trait]
impl Engine for FixedAgent {
    fn name(&self) -> &str {
        "fixed"
    }
    fn kind(&self) -> EngineKind {
        EngineKind::Agent
    }
}

#[async_trait]
impl AgentEngine for FixedAgent {
    async fn run(
        &self,
        input: &TextMessage,
        request: &AgentRequestContext,
    ) -> Result<Option<AgentReply>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(request.clone());
        Ok(Some(AgentReply {
            message: TextMessage::new(format!("agent: {}", input.text().unwrap_or_default())),
            run_id: Some("run-1".into()),
            tools_used: vec![],
            metadata: Map::new(),
        }))
    }
}

struct BytesTts {
    calls: AtomicUsize,
    fail_with_auth: bool,
}

impl BytesTts {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_with_auth: false,
        })
    }

    fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_with_auth: true,
        })
    }
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
        if self.fail_with_auth {
            return Err(EngineError::Auth("invalid api key".into()));
        }
        let voice = options.voice_id.as_deref().unwrap_or("default");
        let text = input[0].text().unwrap_or_default();
        let data = format!("{voice}|{text}").into_bytes();
        Ok(Some(AudioMessage::new(data, AudioFormat::Mp3, 24000, 2)))
    }

    fn default_voice(&self) -> &str {
        "default"
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2,
    }
}

fn wav_audio() -> AudioMessage {
    let mut data = b"RIFF\x24\x00\x00\x00WAVE".to_vec();
    data.extend_from_slice(&[0u8; 32]);
    AudioMessage::new(data, AudioFormat::Wav, 16000, 2)
}

#[tokio::test]
async fn test_text_input_skips_recognition() {
    let asr = ScriptedAsr::new(Some("unused"));
    let llm = Arc::new(EchoLlm::default());
    let tts = BytesTts::new();
    let pipeline = ConversationPipeline::new()
        .with_asr(asr.clone())
        .with_llm(llm.clone())
        .with_tts(tts.clone());

    let result = pipeline.process(ProcessRequest::from_text("hello")).await;

    assert!(result.is_ok(), "unexpected error: {:?}", result.error);
    assert_eq!(result.input_text(), Some("hello"));
    assert_eq!(result.response_text(), Some("echo: hello"));
    assert_eq!(result.audio().unwrap().data, b"default|echo: hello");
    assert_eq!(asr.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_audio_input_runs_all_stages() {
    let asr = ScriptedAsr::new(Some("你好"));
    let pipeline = ConversationPipeline::new()
        .with_asr(asr.clone())
        .with_llm(Arc::new(EchoLlm::default()))
        .with_tts(BytesTts::new())
        .with_language("zh-CN");

    let result = pipeline.process(ProcessRequest::from_audio(wav_audio())).await;

    assert!(result.is_ok());
    assert_eq!(result.input_text(), Some("你好"));
    assert_eq!(result.response_text(), Some("echo: 你好"));
    assert!(result.tts_result.is_some());
    assert_eq!(
        asr.languages.lock().unwrap().as_slice(),
        &[Some("zh-CN".to_string())]
    );
}

#[tokio::test]
async fn test_empty_transcript_is_partial_without_error() {
    let llm = Arc::new(EchoLlm::default());
    let pipeline = ConversationPipeline::new()
        .with_asr(ScriptedAsr::new(None))
        .with_llm(llm.clone())
        .with_tts(BytesTts::new());

    let result = pipeline.process(ProcessRequest::from_audio(wav_audio())).await;

    assert!(result.error.is_none());
    assert!(result.asr_result.is_none());
    assert!(result.response_text().is_none());
    assert!(result.tts_result.is_none());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_asr_reports_not_initialized() {
    let pipeline = ConversationPipeline::new()
        .with_llm(Arc::new(EchoLlm::default()))
        .with_tts(BytesTts::new());

    let result = pipeline.process(ProcessRequest::from_audio(wav_audio())).await;

    assert_eq!(result.error.as_deref(), Some("ASR engine not initialized"));
    assert_eq!(result.failure, Some(FailureKind::Configuration));
}

#[tokio::test]
async fn test_empty_audio_is_invalid_input() {
    let pipeline = ConversationPipeline::new().with_asr(ScriptedAsr::new(Some("x")));
    let audio = AudioMessage::new(Vec::new(), AudioFormat::Wav, 16000, 2);

    let result = pipeline.process(ProcessRequest::from_audio(audio)).await;

    assert_eq!(result.failure, Some(FailureKind::InvalidInput));
}

#[tokio::test]
async fn test_transient_asr_failure_is_retried() {
    let asr = ScriptedAsr::failing_first("retry me", 2);
    let pipeline = ConversationPipeline::new()
        .with_asr(asr.clone())
        .with_llm(Arc::new(EchoLlm::default()))
        .with_retry(fast_retry());

    let mut request = ProcessRequest::from_audio(wav_audio());
    request.skip_tts = true;
    let result = pipeline.process(request).await;

    assert!(result.is_ok());
    assert_eq!(result.input_text(), Some("retry me"));
    assert_eq!(asr.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_agent_is_default_when_configured() {
    let llm = Arc::new(EchoLlm::default());
    let agent = Arc::new(FixedAgent::default());
    let pipeline = ConversationPipeline::new()
        .with_llm(llm.clone())
        .with_agent(agent.clone())
        .with_tts(BytesTts::new());
    assert!(pipeline.agent_by_default());

    let mut request = ProcessRequest::from_text("plan my day");
    request.agent_context = json!({"user": "ada"}).as_object().unwrap().clone();
    request.use_tools = false;
    let result = pipeline.process(request).await;

    assert_eq!(result.response_text(), Some("agent: plan my day"));
    assert!(result.llm_result.is_none());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    let seen = agent.contexts.lock().unwrap();
    assert_eq!(seen[0].context.get("user"), Some(&json!("ada")));
    assert!(!seen[0].use_tools);
}

#[tokio::test]
async fn test_per_call_choice_overrides_agent_default() {
    let llm = Arc::new(EchoLlm::default());
    let agent = Arc::new(FixedAgent::default());
    let pipeline = ConversationPipeline::new()
        .with_llm(llm.clone())
        .with_agent(agent.clone());

    let mut request = ProcessRequest::from_text("hi");
    request.use_agent = Some(false);
    request.skip_tts = true;
    let result = pipeline.process(request).await;

    assert_eq!(result.response_text(), Some("echo: hi"));
    assert_eq!(agent.calls.load(Ordering::SeqCst), 0);

    let pipeline = pipeline.with_use_agent(false);
    assert!(!pipeline.agent_by_default());
    let mut request = ProcessRequest::from_text("hi");
    request.use_agent = Some(true);
    request.skip_tts = true;
    let result = pipeline.process(request).await;
    assert!(result.agent_result.is_some());
}

#[tokio::test]
async fn test_agent_requested_without_agent_uses_llm() {
    let pipeline = ConversationPipeline::new().with_llm(Arc::new(EchoLlm::default()));

    let mut request = ProcessRequest::from_text("hi");
    request.use_agent = Some(true);
    request.skip_tts = true;
    let result = pipeline.process(request).await;

    assert!(result.is_ok());
    assert_eq!(result.response_text(), Some("echo: hi"));
}

#[tokio::test]
async fn test_no_language_engines_is_an_error() {
    let pipeline = ConversationPipeline::new().with_tts(BytesTts::new());

    let result = pipeline.process(ProcessRequest::from_text("hi")).await;

    assert_eq!(
        result.error.as_deref(),
        Some("LLM and Agent engines not initialized")
    );
    assert_eq!(result.failure, Some(FailureKind::Configuration));
    assert_eq!(result.input_text(), Some("hi"));
}

#[tokio::test]
async fn test_history_reaches_llm() {
    let llm = Arc::new(EchoLlm::default());
    let pipeline = ConversationPipeline::new().with_llm(llm.clone());

    let mut request = ProcessRequest::from_text("and then?");
    request.history = vec![ChatTurn::user("first"), ChatTurn::assistant("reply")];
    request.skip_tts = true;
    pipeline.process(request).await;

    assert_eq!(llm.history_lens.lock().unwrap().as_slice(), &[2]);
}

#[tokio::test]
async fn test_history_reaches_agent() {
    let agent = Arc::new(FixedAgent::default());
    let pipeline = ConversationPipeline::new().with_agent(agent.clone());

    let mut request = ProcessRequest::from_text("and my name?");
    request.history = vec![ChatTurn::user("my name is Ada"), ChatTurn::assistant("hi Ada")];
    request.skip_tts = true;
    let result = pipeline.process(request).await;

    assert_eq!(result.response_text(), Some("agent: and my name?"));
    let seen = agent.contexts.lock().unwrap();
    assert_eq!(
        seen[0].history,
        vec![ChatTurn::user("my name is Ada"), ChatTurn::assistant("hi Ada")]
    );
}

#[tokio::test]
async fn test_tts_failure_keeps_earlier_stages() {
    let tts = BytesTts::rejecting();
    let pipeline = ConversationPipeline::new()
        .with_llm(Arc::new(EchoLlm::default()))
        .with_tts(tts.clone())
        .with_retry(fast_retry());

    let result = pipeline.process(ProcessRequest::from_text("hi")).await;

    let error = result.error.as_deref().unwrap();
    assert!(error.starts_with("speech synthesis failed"), "{error}");
    assert_eq!(result.failure, Some(FailureKind::Engine));
    assert_eq!(result.response_text(), Some("echo: hi"));
    assert!(result.tts_result.is_none());
    // Authentication failures are not retried.
    assert_eq!(tts.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_tts_keeps_reply() {
    let pipeline = ConversationPipeline::new().with_llm(Arc::new(EchoLlm::default()));

    let result = pipeline.process(ProcessRequest::from_text("hi")).await;

    assert_eq!(result.error.as_deref(), Some("TTS engine not initialized"));
    assert_eq!(result.response_text(), Some("echo: hi"));
}

#[tokio::test]
async fn test_skip_flags() {
    let llm = Arc::new(EchoLlm::default());
    let tts = BytesTts::new();
    let pipeline = ConversationPipeline::new()
        .with_llm(llm.clone())
        .with_tts(tts.clone());

    let mut request = ProcessRequest::from_text("hi");
    request.skip_llm = true;
    let result = pipeline.process(request).await;
    assert!(result.is_ok());
    assert_eq!(result.input_text(), Some("hi"));
    assert!(result.response_text().is_none());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);

    let mut request = ProcessRequest::from_text("hi");
    request.skip_tts = true;
    let result = pipeline.process(request).await;
    assert_eq!(result.response_text(), Some("echo: hi"));
    assert!(result.tts_result.is_none());
    assert_eq!(tts.calls.load(Ordering::SeqCst), 0);

    let request = ProcessRequest {
        skip_asr: true,
        ..ProcessRequest::default()
    };
    let result = pipeline.process(request).await;
    assert!(result.is_ok());
    assert!(result.asr_result.is_none());
}

#[tokio::test]
async fn test_repeated_synthesis_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AudioCache::open(dir.path().join("tts"), Duration::from_secs(3600))
        .await
        .unwrap();
    let tts = BytesTts::new();
    let pipeline = ConversationPipeline::new()
        .with_tts(tts.clone())
        .with_cache(cache);
    let options = TtsOptions {
        voice_id: Some("warm".into()),
        speed: None,
    };

    let first = pipeline.tts_only("缓存测试", &options).await.unwrap();
    let second = pipeline.tts_only("缓存测试", &options).await.unwrap();

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.audio.data, second.audio.data);
    assert_eq!(tts.calls.load(Ordering::SeqCst), 1);

    // A different voice is a different cache entry.
    let other = TtsOptions {
        voice_id: Some("bright".into()),
        speed: None,
    };
    let third = pipeline.tts_only("缓存测试", &other).await.unwrap();
    assert!(!third.from_cache);
    assert_eq!(tts.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stage_only_calls_swallow_errors() {
    let pipeline = ConversationPipeline::new();

    assert!(pipeline.asr_only(&wav_audio(), &AsrOptions::default()).await.is_none());
    assert!(pipeline.llm_only("hi", &[]).await.is_none());
    assert!(pipeline.tts_only("hi", &TtsOptions::default()).await.is_none());
    assert!(pipeline
        .agent_only("hi", &AgentRequestContext::default())
        .await
        .is_none());

    let err = pipeline.chat("hi", &[]).await.unwrap_err();
    assert_eq!(err.to_string(), "LLM engine not initialized");
}

fn pool_with_mocks(configs: Vec<(EngineKind, EngineConfig)>) -> EnginePool {
    let mut registries = EngineRegistries::new();
    registries
        .llm
        .register("echo", &[], |_| Ok(Arc::new(EchoLlm::default()) as Arc<dyn LlmEngine>))
        .unwrap();
    registries
        .tts
        .register("bytes", &[], |_| Ok(BytesTts::new() as Arc<dyn TtsEngine>))
        .unwrap();
    registries
        .tts
        .register("keyed", &["api_key"], |_| Ok(BytesTts::new() as Arc<dyn TtsEngine>))
        .unwrap();
    registries
        .agent
        .register("fixed", &[], |_| {
            Ok(Arc::new(FixedAgent::default()) as Arc<dyn AgentEngine>)
        })
        .unwrap();
    EnginePool::new(Arc::new(registries), configs)
}

#[tokio::test]
async fn test_from_pool_resolves_stages() {
    let pool = pool_with_mocks(vec![]);
    let settings = PipelineSettings {
        llm: Some("echo".into()),
        tts: Some("bytes".into()),
        agent: Some("fixed".into()),
        use_agent: false,
        ..PipelineSettings::default()
    };

    let pipeline = ConversationPipeline::from_pool(&settings, &pool).await.unwrap();

    assert!(!pipeline.has_asr());
    assert!(pipeline.has_llm());
    assert!(pipeline.has_tts());
    assert!(pipeline.has_agent());
    assert!(!pipeline.agent_by_default());
    assert_eq!(pool.initialized().await.len(), 3);
}

#[tokio::test]
async fn test_from_pool_unknown_engine_fails_fast() {
    let pool = pool_with_mocks(vec![]);
    let settings = PipelineSettings {
        tts: Some("nonexistent".into()),
        ..PipelineSettings::default()
    };

    let err = ConversationPipeline::from_pool(&settings, &pool)
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("nonexistent"), "{message}");
    assert!(message.contains("bytes"), "{message}");
    assert!(message.contains("keyed"), "{message}");
}

#[tokio::test]
async fn test_from_pool_missing_key_fails_fast() {
    let pool = pool_with_mocks(vec![]);
    let settings = PipelineSettings {
        tts: Some("keyed".into()),
        ..PipelineSettings::default()
    };

    let err = ConversationPipeline::from_pool(&settings, &pool)
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "[keyed] missing required configuration key: api_key"
    );
}

#[tokio::test]
async fn test_from_pool_disabled_stage_is_absent() {
    let disabled = EngineConfig {
        enabled: false,
        ..EngineConfig::new("fixed")
    };
    let pool = pool_with_mocks(vec![(EngineKind::Agent, disabled)]);
    let settings = PipelineSettings {
        llm: Some("echo".into()),
        agent: Some("fixed".into()),
        ..PipelineSettings::default()
    };

    let pipeline = ConversationPipeline::from_pool(&settings, &pool).await.unwrap();

    assert!(!pipeline.has_agent());
    assert!(!pipeline.agent_by_default());
}

#[tokio::test]
async fn test_overrides_swap_stages() {
    let pool = pool_with_mocks(vec![]);
    let pipeline = ConversationPipeline::new().with_llm(Arc::new(EchoLlm::default()));
    assert!(!pipeline.has_agent());

    let overrides = StageOverrides {
        agent: Some("fixed".into()),
        ..StageOverrides::default()
    };
    let swapped = pipeline.with_overrides(&pool, &overrides).await.unwrap();
    assert!(swapped.has_agent());
    assert!(!pipeline.has_agent());

    let bad = StageOverrides {
        llm: Some("missing".into()),
        ..StageOverrides::default()
    };
    assert!(pipeline.with_overrides(&pool, &bad).await.is_err());
}
