//! Tool-calling agent over an OpenAI-compatible chat API.
//!
//! The agent runs a bounded loop: it offers the model a `search_documents`
//! tool backed by a local [`DocumentIndex`], executes whatever calls come
//! back, and stops at the first plain-text answer.

use crate::documents::DocumentIndex;
use crate::http;
use crate::llm::{reply_from, OPENAI_CHAT_URL};
use crate::openai::{ChatMessage, ChatRequest, ChatResponse, ToolCall};
use async_trait::async_trait;
use dh_engine::{AgentEngine, AgentRequestContext, Engine, EngineConfig, EngineError, EngineKind};
use dh_types::{AgentReply, TextMessage};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::OnceCell;

pub const SEARCH_TOOL: &str = "search_documents";

const DEFAULT_INSTRUCTIONS: &str =
    "You are a knowledgeable digital human. Use the search_documents tool when the \
     question may be answered by the internal knowledge base, then answer concisely.";

fn default_instructions() -> String {
    DEFAULT_INSTRUCTIONS.to_string()
}

fn default_max_tool_rounds() -> u32 {
    4
}

fn default_max_results() -> usize {
    3
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1500
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_instructions")]
    pub instructions: String,
    /// Directory of `.txt`/`.md` files searchable through the tool.
    #[serde(default)]
    pub documents_dir: Option<PathBuf>,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    max_results: Option<usize>,
}

pub struct OpenAiAgent {
    name: String,
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
    settings: AgentSettings,
    tools: Value,
    documents: OnceCell<DocumentIndex>,
}

impl OpenAiAgent {
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let settings: AgentSettings = config.settings()?;
        let timeout = Duration::from_secs(settings.timeout_secs.max(1));
        Ok(Self {
            name: config.name.clone(),
            endpoint: settings
                .endpoint
                .clone()
                .unwrap_or_else(|| OPENAI_CHAT_URL.to_string()),
            timeout,
            client: http::client(timeout)?,
            tools: search_tool_schema(settings.max_results),
            settings,
            documents: OnceCell::new(),
        })
    }

    async fn documents(&self) -> &DocumentIndex {
        self.documents
            .get_or_init(|| async {
                match &self.settings.documents_dir {
                    Some(dir) => DocumentIndex::load(dir).await,
                    None => DocumentIndex::default(),
                }
            })
            .await
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        offer_tools: bool,
    ) -> Result<ChatResponse, EngineError> {
        let body = ChatRequest {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            tools: offer_tools.then_some(&self.tools),
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport_error(e, self.timeout))?;
        let response = http::ensure_success(response).await?;
        http::read_json(response).await
    }

    async fn call_tool(&self, call: &ToolCall) -> String {
        if call.function.name != SEARCH_TOOL {
            return json!({"error": format!("unknown tool '{}'", call.function.name)}).to_string();
        }
        let args: SearchArgs = match serde_json::from_str(&call.function.arguments) {
            Ok(args) => args,
            Err(e) => return json!({"error": format!("invalid arguments: {e}")}).to_string(),
        };
        let limit = args
            .max_results
            .unwrap_or(self.settings.max_results)
            .clamp(1, 10);
        let hits = self.documents().await.search(&args.query, limit);
        tracing::debug!(engine = %self.name, query = %args.query, hits = hits.len(), "document search");
        json!({ "documents": hits }).to_string()
    }
}

fn search_tool_schema(max_results: usize) -> Value {
    json!([{
        "type": "function",
        "function": {
            "name": SEARCH_TOOL,
            "description": "Search the internal knowledge base for passages relevant to a query.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to look for."},
                    "max_results": {"type": "integer", "default": max_results}
                },
                "required": ["query"]
            }
        }
    }])
}

/// System messages for the agent: instructions, then the caller's context
/// when there is any.
fn preamble(instructions: &str, context: &Map<String, Value>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::new("system", instructions)];
    if !context.is_empty() {
        messages.push(ChatMessage::new(
            "system",
            format!("Conversation context: {}", Value::Object(context.clone())),
        ));
    }
    messages
}

#[async_trait]
impl Engine for OpenAiAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Agent
    }
}

#[async_trait]
impl AgentEngine for OpenAiAgent {
    async fn run(
        &self,
        input: &TextMessage,
        request: &AgentRequestContext,
    ) -> Result<Option<AgentReply>, EngineError> {
        let Some(query) = input.text() else {
            return Err(EngineError::InvalidInput("agent query is empty".into()));
        };
        let run_id = uuid::Uuid::new_v4().to_string();
        let offer_tools = request.use_tools && !self.documents().await.is_empty();

        let mut messages = preamble(&self.settings.instructions, &request.context);
        messages.extend(
            request
                .history
                .iter()
                .map(|turn| ChatMessage::new(turn.role.as_str(), turn.content.clone())),
        );
        messages.push(ChatMessage::new("user", query));

        let mut tools_used: Vec<String> = Vec::new();
        let mut rounds = 0;
        loop {
            rounds += 1;
            // Past the round budget the model must answer without tools.
            let may_call = offer_tools && rounds <= self.settings.max_tool_rounds;
            let response = self.complete(&messages, may_call).await?;
            let assistant = match response.choices.first() {
                Some(choice) => choice.message.clone(),
                None => {
                    return Err(EngineError::MalformedResponse("response has no choices".into()))
                }
            };

            if !may_call || assistant.tool_calls.is_empty() {
                let text = reply_from(response)?;
                tracing::info!(engine = %self.name, run_id = %run_id, rounds, tools = ?tools_used, "agent run finished");
                return Ok(text.map(|text| {
                    let mut metadata = Map::new();
                    metadata.insert("model".into(), Value::String(self.settings.model.clone()));
                    metadata.insert("rounds".into(), Value::from(rounds));
                    AgentReply {
                        message: TextMessage::new(text).with_desc("assistant"),
                        run_id: Some(run_id.clone()),
                        tools_used: tools_used.clone(),
                        metadata,
                    }
                }));
            }

            for call in &assistant.tool_calls {
                if !tools_used.contains(&call.function.name) {
                    tools_used.push(call.function.name.clone());
                }
            }
            let mut results = Vec::with_capacity(assistant.tool_calls.len());
            for call in &assistant.tool_calls {
                results.push(ChatMessage::tool_result(&call.id, self.call_tool(call).await));
            }
            messages.push(assistant);
            messages.extend(results);
        }
    }
}
