use crate::contract::EngineKind;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or running an engine.
///
/// "Nothing to say" is not an error: engines return `Ok(None)` for an empty
/// semantic result. Every variant here is either a configuration fault, a
/// caller fault, or a provider/transport failure.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("[{engine}] missing required configuration key: {key}")]
    MissingKey { engine: String, key: String },

    #[error("unknown {kind} engine '{name}'; registered {kind} engines: [{}]", .available.join(", "))]
    UnknownEngine {
        kind: EngineKind,
        name: String,
        available: Vec<String>,
    },

    #[error("{kind} engine '{name}' is already registered")]
    DuplicateEngine { kind: EngineKind, name: String },

    #[error("{kind} engine '{name}' is disabled")]
    Disabled { kind: EngineKind, name: String },

    #[error("{} engine not initialized", .0.label())]
    NotConfigured(EngineKind),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("provider returned status {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("engine failure: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns `true` for transient failures worth another attempt:
    /// transport errors, timeouts, rate limiting and provider-side 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` for faults an operator must fix in configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingKey { .. }
                | Self::UnknownEngine { .. }
                | Self::DuplicateEngine { .. }
                | Self::Disabled { .. }
                | Self::NotConfigured(_)
                | Self::Config(_)
        )
    }

    /// Maps an HTTP status and body returned by a provider.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            401 | 403 => Self::Auth(message),
            _ => Self::Provider { status, message },
        }
    }
}
