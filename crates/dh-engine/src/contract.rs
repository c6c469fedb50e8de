//! The uniform engine contract.
//!
//! Each capability gets its own trait with a single `run` operation. An
//! `Ok(None)` result means the engine had nothing to say (silence, empty
//! completion); failures are always `Err`.

use crate::error::EngineError;
use async_trait::async_trait;
use dh_types::{AgentReply, AudioMessage, ChatTurn, TextMessage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The four engine capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Asr,
    Llm,
    Tts,
    Agent,
}

impl EngineKind {
    pub const ALL: [EngineKind; 4] = [Self::Asr, Self::Llm, Self::Tts, Self::Agent];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asr => "asr",
            Self::Llm => "llm",
            Self::Tts => "tts",
            Self::Agent => "agent",
        }
    }

    /// Human-facing label used in operator messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Asr => "ASR",
            Self::Llm => "LLM",
            Self::Tts => "TTS",
            Self::Agent => "Agent",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour shared by every engine regardless of capability.
#[async_trait]
pub trait Engine: Send + Sync {
    /// The registered name, e.g. `"deepgram"`.
    fn name(&self) -> &str;

    fn kind(&self) -> EngineKind;

    /// Releases held resources. Called once by the pool on shutdown.
    async fn release(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsrOptions {
    /// BCP-47 language hint; `None` uses the engine default.
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TtsOptions {
    /// Voice identifier; `None` uses the engine default.
    pub voice_id: Option<String>,
    pub speed: Option<f32>,
}

/// Per-request data handed to an agent run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequestContext {
    /// Stored conversation context merged with request-supplied keys.
    pub context: Map<String, Value>,
    /// Earlier turns of the conversation, oldest first.
    pub history: Vec<ChatTurn>,
    pub use_tools: bool,
}

impl Default for AgentRequestContext {
    fn default() -> Self {
        Self {
            context: Map::new(),
            history: Vec::new(),
            use_tools: true,
        }
    }
}

#[async_trait]
pub trait AsrEngine: Engine {
    /// Transcribes the first audio message. Extra inputs are ignored.
    async fn run(
        &self,
        input: &[AudioMessage],
        options: &AsrOptions,
    ) -> Result<Option<TextMessage>, EngineError>;
}

#[async_trait]
pub trait LlmEngine: Engine {
    /// Generates a reply to the first input, given prior turns.
    async fn run(
        &self,
        input: &[TextMessage],
        history: &[ChatTurn],
    ) -> Result<Option<TextMessage>, EngineError>;
}

#[async_trait]
pub trait TtsEngine: Engine {
    /// Synthesizes the concatenated text of all inputs.
    async fn run(
        &self,
        input: &[TextMessage],
        options: &TtsOptions,
    ) -> Result<Option<AudioMessage>, EngineError>;

    /// Voice used when the request names none.
    fn default_voice(&self) -> &str;

    /// Synthesis parameters, beyond text and voice, that change the output
    /// bytes. Feeds the audio cache key.
    fn cache_params(&self, options: &TtsOptions) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("engine".to_string(), self.name().to_string());
        if let Some(speed) = options.speed {
            params.insert("speed".to_string(), speed.to_string());
        }
        params
    }
}

#[async_trait]
pub trait AgentEngine: Engine {
    async fn run(
        &self,
        input: &TextMessage,
        request: &AgentRequestContext,
    ) -> Result<Option<AgentReply>, EngineError>;
}

/// A constructed engine of any kind, as held by the pool.
#[derive(Clone)]
pub enum EngineHandle {
    Asr(Arc<dyn AsrEngine>),
    Llm(Arc<dyn LlmEngine>),
    Tts(Arc<dyn TtsEngine>),
    Agent(Arc<dyn AgentEngine>),
}

impl EngineHandle {
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Asr(_) => EngineKind::Asr,
            Self::Llm(_) => EngineKind::Llm,
            Self::Tts(_) => EngineKind::Tts,
            Self::Agent(_) => EngineKind::Agent,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Asr(e) => e.name(),
            Self::Llm(e) => e.name(),
            Self::Tts(e) => e.name(),
            Self::Agent(e) => e.name(),
        }
    }

    pub async fn release(&self) -> Result<(), EngineError> {
        match self {
            Self::Asr(e) => e.release().await,
            Self::Llm(e) => e.release().await,
            Self::Tts(e) => e.release().await,
            Self::Agent(e) => e.release().await,
        }
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineHandle({}:{})", self.kind(), self.name())
    }
}

/// Returns the first input, logging when extra inputs are dropped.
pub fn first_input<'a, T>(engine: &str, input: &'a [T]) -> Option<&'a T> {
    if input.len() > 1 {
        tracing::debug!(
            engine,
            received = input.len(),
            "engine processes only the first input, ignoring the rest"
        );
    }
    input.first()
}

/// Joins the present texts of `input` with spaces. `None` when nothing is
/// left to say.
pub fn joined_text(input: &[TextMessage]) -> Option<String> {
    let parts: Vec<&str> = input.iter().filter_map(TextMessage::text).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joined_text_skips_missing_and_blank() {
        let input = vec![
            TextMessage::new("Hello"),
            TextMessage::pending(),
            TextMessage::new("  "),
            TextMessage::new("world."),
        ];
        assert_eq!(joined_text(&input).as_deref(), Some("Hello world."));
        assert_eq!(joined_text(&[TextMessage::pending()]), None);
    }

    #[test]
    fn first_input_takes_head() {
        let input = [1, 2, 3];
        assert_eq!(first_input("mock", &input), Some(&1));
        assert_eq!(first_input::<u8>("mock", &[]), None);
    }

    #[test]
    fn kind_labels() {
        assert_eq!(EngineKind::Agent.to_string(), "agent");
        assert_eq!(serde_json::to_string(&EngineKind::Tts).unwrap(), "\"tts\"");
    }
}
