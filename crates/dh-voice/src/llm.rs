//! Chat-completion language model engines.
//!
//! `OpenAiLlm` speaks the OpenAI chat completions protocol and is registered
//! twice: as `openai` against api.openai.com, and as `minimax` against
//! MiniMax's compatible endpoint (which also wants a group id header and may
//! report errors in `base_resp`).

use crate::http;
use crate::openai::{ChatMessage, ChatRequest, ChatResponse};
use async_trait::async_trait;
use dh_engine::{Engine, EngineConfig, EngineError, EngineKind, LlmEngine};
use dh_types::{ChatTurn, TextMessage};
use serde::Deserialize;
use std::time::Duration;

pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const MINIMAX_CHAT_URL: &str = "https://api.minimax.chat/v1/text/chatcompletion_v2";

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a friendly digital human. Answer conversationally and keep replies short \
     enough to be spoken aloud.";

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1500
}

fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSettings {
    pub api_key: String,
    pub model: String,
    /// Full chat completions URL; defaults per provider.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

pub struct OpenAiLlm {
    name: String,
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
    settings: ChatSettings,
}

impl OpenAiLlm {
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::build(config, OPENAI_CHAT_URL)
    }

    pub fn minimax(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::build(config, MINIMAX_CHAT_URL)
    }

    fn build(config: &EngineConfig, default_endpoint: &str) -> Result<Self, EngineError> {
        let settings: ChatSettings = config.settings()?;
        let timeout = Duration::from_secs(settings.timeout_secs.max(1));
        tracing::info!(engine = %config.name, model = %settings.model, "language model engine ready");
        Ok(Self {
            name: config.name.clone(),
            endpoint: settings
                .endpoint
                .clone()
                .unwrap_or_else(|| default_endpoint.to_string()),
            timeout,
            client: http::client(timeout)?,
            settings,
        })
    }

    fn build_messages(&self, input: &[TextMessage], history: &[ChatTurn]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + input.len() + 1);
        messages.push(ChatMessage::new("system", self.settings.system_prompt.clone()));
        messages.extend(
            history
                .iter()
                .map(|turn| ChatMessage::new(turn.role.as_str(), turn.content.clone())),
        );
        messages.extend(
            input
                .iter()
                .filter_map(TextMessage::text)
                .map(|text| ChatMessage::new("user", text)),
        );
        messages
    }
}

#[async_trait]
impl Engine for OpenAiLlm {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Llm
    }
}

#[async_trait]
impl LlmEngine for OpenAiLlm {
    async fn run(
        &self,
        input: &[TextMessage],
        history: &[ChatTurn],
    ) -> Result<Option<TextMessage>, EngineError> {
        if !input.iter().any(|m| m.text().is_some()) {
            return Err(EngineError::InvalidInput("no user text to answer".into()));
        }
        let messages = self.build_messages(input, history);
        let body = ChatRequest {
            model: &self.settings.model,
            messages: &messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            tools: None,
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.settings.api_key)
            .json(&body);
        if let Some(group_id) = &self.settings.group_id {
            request = request.header("X-Minimax-Group-Id", group_id);
        }

        tracing::debug!(engine = %self.name, turns = messages.len(), "sending chat completion");
        let response = request
            .send()
            .await
            .map_err(|e| http::transport_error(e, self.timeout))?;
        let response = http::ensure_success(response).await?;
        let parsed: ChatResponse = http::read_json(response).await?;
        reply_from(parsed).map(|reply| reply.map(|text| TextMessage::new(text).with_desc("assistant")))
    }
}

/// Extracts the trimmed reply text; `None` for an empty completion.
pub(crate) fn reply_from(response: ChatResponse) -> Result<Option<String>, EngineError> {
    let ChatResponse { choices, base_resp } = response;
    if let Some(base) = base_resp {
        base.into_result()?;
    }
    let Some(choice) = choices.into_iter().next() else {
        return Err(EngineError::MalformedResponse("response has no choices".into()));
    };
    Ok(choice
        .message
        .content
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty()))
}
