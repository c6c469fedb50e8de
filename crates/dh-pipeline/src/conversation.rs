//! The ASR → LLM/Agent → TTS turn state machine.

use crate::realtime::BufferedTranscription;
use dh_engine::{
    retry, AgentEngine, AgentRequestContext, AsrEngine, AsrOptions, AudioCache, EngineError,
    EngineKind, EnginePool, LlmEngine, RetryPolicy, TtsEngine, TtsOptions,
};
use dh_types::{AgentReply, AudioFormat, AudioMessage, ChatTurn, Synthesis, TextMessage};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

fn default_use_agent() -> bool {
    true
}

/// Which engine backs each stage, by registered name. A stage with no name
/// (or whose engine is disabled) is absent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub asr: Option<String>,
    #[serde(default)]
    pub llm: Option<String>,
    #[serde(default)]
    pub tts: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    /// Take the agent path by default when an agent engine is available.
    #[serde(default = "default_use_agent")]
    pub use_agent: bool,
    /// Recognition language used when a request names none.
    #[serde(default)]
    pub language: Option<String>,
    /// Synthesis voice used when a request names none.
    #[serde(default)]
    pub voice_id: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            asr: None,
            llm: None,
            tts: None,
            agent: None,
            use_agent: default_use_agent(),
            language: None,
            voice_id: None,
        }
    }
}

/// Per-connection engine choices that replace the pipeline defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOverrides {
    pub asr: Option<String>,
    pub llm: Option<String>,
    pub tts: Option<String>,
    pub agent: Option<String>,
}

impl StageOverrides {
    pub fn is_empty(&self) -> bool {
        self.asr.is_none() && self.llm.is_none() && self.tts.is_none() && self.agent.is_none()
    }
}

/// Inputs for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub audio: Option<AudioMessage>,
    /// Direct text input; when present and non-blank, recognition is skipped.
    pub text_input: Option<String>,
    /// Prior turns replayed to the language model.
    pub history: Vec<ChatTurn>,
    /// Structured context for agent runs (already merged with the stored
    /// context by the caller).
    pub agent_context: Map<String, Value>,
    /// Overrides the pipeline's agent/LLM default for this call.
    pub use_agent: Option<bool>,
    pub use_tools: bool,
    pub skip_asr: bool,
    pub skip_llm: bool,
    pub skip_tts: bool,
    pub asr_options: AsrOptions,
    pub tts_options: TtsOptions,
    /// Correlates log lines for one session.
    pub session_id: Option<String>,
}

impl Default for ProcessRequest {
    fn default() -> Self {
        Self {
            audio: None,
            text_input: None,
            history: Vec::new(),
            agent_context: Map::new(),
            use_agent: None,
            use_tools: true,
            skip_asr: false,
            skip_llm: false,
            skip_tts: false,
            asr_options: AsrOptions::default(),
            tts_options: TtsOptions::default(),
            session_id: None,
        }
    }
}

impl ProcessRequest {
    pub fn from_audio(audio: AudioMessage) -> Self {
        Self {
            audio: Some(audio),
            ..Self::default()
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text_input: Some(text.into()),
            ..Self::default()
        }
    }
}

/// Broad class of a pipeline failure, for mapping onto transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The caller sent something unusable.
    InvalidInput,
    /// A required engine is missing or misconfigured.
    Configuration,
    /// A provider or local engine failed.
    Engine,
}

impl FailureKind {
    fn of(err: &EngineError) -> Self {
        match err {
            EngineError::InvalidInput(_) => Self::InvalidInput,
            e if e.is_configuration() => Self::Configuration,
            _ => Self::Engine,
        }
    }
}

/// Outcome of one invocation. Every stage that ran leaves its output here,
/// even when a later stage failed.
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub asr_result: Option<TextMessage>,
    pub llm_result: Option<TextMessage>,
    pub agent_result: Option<AgentReply>,
    pub tts_result: Option<Synthesis>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl PipelineResult {
    /// The user's words: recognised or supplied directly.
    pub fn input_text(&self) -> Option<&str> {
        self.asr_result.as_ref().and_then(TextMessage::text)
    }

    /// The reply text, preferring the agent's when both exist.
    pub fn response_text(&self) -> Option<&str> {
        self.agent_result
            .as_ref()
            .and_then(AgentReply::text)
            .or_else(|| self.llm_result.as_ref().and_then(TextMessage::text))
    }

    pub fn audio(&self) -> Option<&AudioMessage> {
        self.tts_result.as_ref().map(|s| &s.audio)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn fail(self, stage: Stage, err: EngineError) -> Self {
        let message = match &err {
            EngineError::NotConfigured(_) => err.to_string(),
            _ => format!("{stage} failed: {err}"),
        };
        self.record(stage, FailureKind::of(&err), message)
    }

    fn record(mut self, stage: Stage, kind: FailureKind, message: String) -> Self {
        tracing::error!(stage = %stage, "{}", message);
        self.failure = Some(kind);
        self.error = Some(message);
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Asr,
    Language,
    Agent,
    Tts,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Asr => "speech recognition",
            Self::Language => "language model",
            Self::Agent => "agent",
            Self::Tts => "speech synthesis",
        })
    }
}

/// Stateless per call; all session state lives with the caller.
#[derive(Clone)]
pub struct ConversationPipeline {
    asr: Option<Arc<dyn AsrEngine>>,
    llm: Option<Arc<dyn LlmEngine>>,
    tts: Option<Arc<dyn TtsEngine>>,
    agent: Option<Arc<dyn AgentEngine>>,
    use_agent: bool,
    retry: RetryPolicy,
    cache: Option<AudioCache>,
    language: Option<String>,
    voice_id: Option<String>,
}

impl Default for ConversationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConversationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationPipeline")
            .field("asr", &self.asr.as_ref().map(|e| e.name().to_string()))
            .field("llm", &self.llm.as_ref().map(|e| e.name().to_string()))
            .field("tts", &self.tts.as_ref().map(|e| e.name().to_string()))
            .field("agent", &self.agent.as_ref().map(|e| e.name().to_string()))
            .field("use_agent", &self.use_agent)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

fn stage_name(name: Option<&str>) -> Option<&str> {
    name.map(str::trim).filter(|n| !n.is_empty())
}

/// A disabled engine leaves its stage absent; every other error is fatal.
fn absent_if_disabled<T>(result: Result<T, EngineError>) -> Result<Option<T>, EngineError> {
    match result {
        Ok(engine) => Ok(Some(engine)),
        Err(EngineError::Disabled { kind, name }) => {
            tracing::warn!(kind = %kind, engine = %name, "engine disabled, stage will be absent");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl ConversationPipeline {
    /// A pipeline with no stages, the agent default on and the default
    /// retry policy.
    pub fn new() -> Self {
        Self {
            asr: None,
            llm: None,
            tts: None,
            agent: None,
            use_agent: true,
            retry: RetryPolicy::default(),
            cache: None,
            language: None,
            voice_id: None,
        }
    }

    pub fn with_asr(mut self, engine: Arc<dyn AsrEngine>) -> Self {
        self.asr = Some(engine);
        self
    }

    pub fn with_llm(mut self, engine: Arc<dyn LlmEngine>) -> Self {
        self.llm = Some(engine);
        self
    }

    pub fn with_tts(mut self, engine: Arc<dyn TtsEngine>) -> Self {
        self.tts = Some(engine);
        self
    }

    pub fn with_agent(mut self, engine: Arc<dyn AgentEngine>) -> Self {
        self.agent = Some(engine);
        self
    }

    pub fn with_use_agent(mut self, use_agent: bool) -> Self {
        self.use_agent = use_agent;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, cache: AudioCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = Some(voice_id.into());
        self
    }

    /// Resolves every configured stage through `pool`.
    ///
    /// Unknown engine names and missing required keys fail here, at
    /// startup, rather than on the first request.
    pub async fn from_pool(
        settings: &PipelineSettings,
        pool: &EnginePool,
    ) -> Result<Self, EngineError> {
        let mut pipeline = Self::new().with_use_agent(settings.use_agent);
        pipeline.language = settings.language.clone();
        pipeline.voice_id = settings.voice_id.clone();

        if let Some(name) = stage_name(settings.asr.as_deref()) {
            pipeline.asr = absent_if_disabled(pool.asr(name).await)?;
        }
        if let Some(name) = stage_name(settings.llm.as_deref()) {
            pipeline.llm = absent_if_disabled(pool.llm(name).await)?;
        }
        if let Some(name) = stage_name(settings.tts.as_deref()) {
            pipeline.tts = absent_if_disabled(pool.tts(name).await)?;
        }
        if let Some(name) = stage_name(settings.agent.as_deref()) {
            pipeline.agent = absent_if_disabled(pool.agent(name).await)?;
        }

        tracing::info!(
            asr = pipeline.asr.is_some(),
            llm = pipeline.llm.is_some(),
            tts = pipeline.tts.is_some(),
            agent = pipeline.agent.is_some(),
            agent_default = pipeline.agent_by_default(),
            "conversation pipeline ready"
        );
        Ok(pipeline)
    }

    /// A copy of this pipeline with the named stages swapped for other
    /// engines from `pool`.
    pub async fn with_overrides(
        &self,
        pool: &EnginePool,
        overrides: &StageOverrides,
    ) -> Result<Self, EngineError> {
        let mut pipeline = self.clone();
        if let Some(name) = stage_name(overrides.asr.as_deref()) {
            pipeline.asr = Some(pool.asr(name).await?);
        }
        if let Some(name) = stage_name(overrides.llm.as_deref()) {
            pipeline.llm = Some(pool.llm(name).await?);
        }
        if let Some(name) = stage_name(overrides.tts.as_deref()) {
            pipeline.tts = Some(pool.tts(name).await?);
        }
        if let Some(name) = stage_name(overrides.agent.as_deref()) {
            pipeline.agent = Some(pool.agent(name).await?);
        }
        Ok(pipeline)
    }

    pub fn has_asr(&self) -> bool {
        self.asr.is_some()
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub fn has_tts(&self) -> bool {
        self.tts.is_some()
    }

    pub fn has_agent(&self) -> bool {
        self.agent.is_some()
    }

    /// Whether a call that does not choose takes the agent path.
    pub fn agent_by_default(&self) -> bool {
        self.use_agent && self.agent.is_some()
    }

    pub fn cache(&self) -> Option<&AudioCache> {
        self.cache.as_ref()
    }

    /// Runs one turn. Never fails: errors are reported in the result along
    /// with whatever the earlier stages produced.
    pub async fn process(&self, request: ProcessRequest) -> PipelineResult {
        let span = tracing::info_span!(
            "pipeline",
            session_id = %request.session_id.as_deref().unwrap_or("-")
        );
        self.run_turn(request).instrument(span).await
    }

    async fn run_turn(&self, request: ProcessRequest) -> PipelineResult {
        let mut result = PipelineResult::default();

        // Recognition.
        let direct = request
            .text_input
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let user_text = if let Some(text) = direct {
            result.asr_result = Some(TextMessage::new(text).with_desc("user"));
            text.to_string()
        } else if request.skip_asr {
            tracing::debug!("recognition skipped without text input, nothing to do");
            return result;
        } else {
            let Some(audio) = request.audio.as_ref() else {
                return result.fail(
                    Stage::Asr,
                    EngineError::InvalidInput("no audio or text input supplied".into()),
                );
            };
            match self.transcribe(audio, &request.asr_options).await {
                Ok(Some(message)) => {
                    let text = message.text().map(str::to_string);
                    result.asr_result = Some(message);
                    match text {
                        Some(text) => text,
                        None => return result,
                    }
                }
                Ok(None) => {
                    tracing::info!(stage = "asr", "no speech recognised");
                    return result;
                }
                Err(e) => return result.fail(Stage::Asr, e),
            }
        };

        // Language.
        if request.skip_llm {
            tracing::debug!("language stage skipped");
            return result;
        }
        let wants_agent = request.use_agent.unwrap_or_else(|| self.agent_by_default());
        let reply_text = if wants_agent && self.agent.is_some() {
            let input = TextMessage::new(user_text.as_str()).with_desc("user");
            let agent_request = AgentRequestContext {
                context: request.agent_context.clone(),
                history: request.history.clone(),
                use_tools: request.use_tools,
            };
            match self.run_agent(&input, &agent_request).await {
                Ok(reply) => {
                    let text = reply.as_ref().and_then(AgentReply::text).map(str::to_string);
                    result.agent_result = reply;
                    text
                }
                Err(e) => return result.fail(Stage::Agent, e),
            }
        } else if self.llm.is_some() {
            if wants_agent {
                tracing::debug!("agent requested but not available, using language model");
            }
            match self.chat(&user_text, &request.history).await {
                Ok(reply) => {
                    let text = reply.as_ref().and_then(TextMessage::text).map(str::to_string);
                    result.llm_result = reply;
                    text
                }
                Err(e) => return result.fail(Stage::Language, e),
            }
        } else if wants_agent {
            return result.record(
                Stage::Language,
                FailureKind::Configuration,
                "LLM and Agent engines not initialized".to_string(),
            );
        } else {
            return result.fail(Stage::Language, EngineError::NotConfigured(EngineKind::Llm));
        };
        let Some(reply_text) = reply_text else {
            tracing::info!(stage = "llm", "language stage returned no reply");
            return result;
        };

        // Synthesis.
        if request.skip_tts {
            return result;
        }
        match self.synthesize(&reply_text, &request.tts_options).await {
            Ok(synthesis) => result.tts_result = synthesis,
            Err(e) => return result.fail(Stage::Tts, e),
        }
        result
    }

    /// Recognises `audio` with retry. Empty audio is a caller error.
    pub async fn transcribe(
        &self,
        audio: &AudioMessage,
        options: &AsrOptions,
    ) -> Result<Option<TextMessage>, EngineError> {
        let engine = self
            .asr
            .as_ref()
            .ok_or(EngineError::NotConfigured(EngineKind::Asr))?;
        if audio.is_empty() {
            return Err(EngineError::InvalidInput("audio payload is empty".into()));
        }
        let options = self.asr_options(options);
        let input = std::slice::from_ref(audio);
        retry(&self.retry, "asr", || engine.run(input, &options)).await
    }

    /// Generates a reply to `text` after `history`, with retry.
    pub async fn chat(
        &self,
        text: &str,
        history: &[ChatTurn],
    ) -> Result<Option<TextMessage>, EngineError> {
        let engine = self
            .llm
            .as_ref()
            .ok_or(EngineError::NotConfigured(EngineKind::Llm))?;
        let input = [TextMessage::new(text).with_desc("user")];
        retry(&self.retry, "llm", || engine.run(&input, history)).await
    }

    /// Runs the agent with retry.
    pub async fn run_agent(
        &self,
        input: &TextMessage,
        request: &AgentRequestContext,
    ) -> Result<Option<AgentReply>, EngineError> {
        let engine = self
            .agent
            .as_ref()
            .ok_or(EngineError::NotConfigured(EngineKind::Agent))?;
        retry(&self.retry, "agent", || engine.run(input, request)).await
    }

    /// Synthesizes `text`, serving from and writing through the audio cache
    /// when one is attached.
    pub async fn synthesize(
        &self,
        text: &str,
        options: &TtsOptions,
    ) -> Result<Option<Synthesis>, EngineError> {
        let engine = self
            .tts
            .as_ref()
            .ok_or(EngineError::NotConfigured(EngineKind::Tts))?;
        let options = TtsOptions {
            voice_id: options.voice_id.clone().or_else(|| self.voice_id.clone()),
            speed: options.speed,
        };

        let cache_key = self.cache.as_ref().map(|_| {
            let voice = options
                .voice_id
                .as_deref()
                .unwrap_or_else(|| engine.default_voice());
            AudioCache::content_key(text, voice, &engine.cache_params(&options))
        });
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(audio) = cache.get_cached_audio(key).await {
                tracing::debug!(stage = "tts", key = %key, "served synthesis from cache");
                return Ok(Some(Synthesis {
                    audio: audio.with_desc(text),
                    from_cache: true,
                }));
            }
        }

        let input = [TextMessage::new(text)];
        let audio = retry(&self.retry, "tts", || engine.run(&input, &options)).await?;
        if let (Some(audio), Some(cache), Some(key)) = (&audio, &self.cache, &cache_key) {
            cache.save_to_cache(key, audio).await;
        }
        Ok(audio.map(|audio| Synthesis {
            audio,
            from_cache: false,
        }))
    }

    /// Recognition only. Errors are logged and reported as `None`.
    pub async fn asr_only(&self, audio: &AudioMessage, options: &AsrOptions) -> Option<TextMessage> {
        self.transcribe(audio, options)
            .await
            .unwrap_or_else(|e| log_stage_error(Stage::Asr, e))
    }

    /// Language model only. Errors are logged and reported as `None`.
    pub async fn llm_only(&self, text: &str, history: &[ChatTurn]) -> Option<TextMessage> {
        self.chat(text, history)
            .await
            .unwrap_or_else(|e| log_stage_error(Stage::Language, e))
    }

    /// Synthesis only. Errors are logged and reported as `None`.
    pub async fn tts_only(&self, text: &str, options: &TtsOptions) -> Option<Synthesis> {
        self.synthesize(text, options)
            .await
            .unwrap_or_else(|e| log_stage_error(Stage::Tts, e))
    }

    /// Agent only. Errors are logged and reported as `None`.
    pub async fn agent_only(
        &self,
        text: &str,
        request: &AgentRequestContext,
    ) -> Option<AgentReply> {
        let input = TextMessage::new(text).with_desc("user");
        self.run_agent(&input, request)
            .await
            .unwrap_or_else(|e| log_stage_error(Stage::Agent, e))
    }

    /// Opens a buffered recognition session on this pipeline's ASR engine.
    pub fn transcription_session(
        &self,
        format: AudioFormat,
        sample_rate: u32,
        sample_width: u16,
        options: &AsrOptions,
    ) -> Option<BufferedTranscription> {
        let engine = self.asr.clone()?;
        Some(BufferedTranscription::new(
            engine,
            self.retry,
            self.asr_options(options),
            format,
            sample_rate,
            sample_width,
        ))
    }

    fn asr_options(&self, options: &AsrOptions) -> AsrOptions {
        AsrOptions {
            language: options.language.clone().or_else(|| self.language.clone()),
        }
    }
}

fn log_stage_error<T>(stage: Stage, err: EngineError) -> Option<T> {
    tracing::error!(stage = %stage, "{} failed: {}", stage, err);
    None
}
