use dh_engine::EngineError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of subprocess-backed collaborators (local ASR/TTS binaries and
/// the video generator).
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("{what} exceeds maximum size: {size} bytes (limit: {limit} bytes)")]
    InputTooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {} seconds", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    #[error("{program} failed: {stderr}")]
    ProcessFailed { program: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VoiceError> for EngineError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::Config(msg) => EngineError::Config(msg),
            VoiceError::NotFound(path) => {
                EngineError::Config(format!("file not found: {}", path.display()))
            }
            VoiceError::InputTooLarge { .. } => EngineError::InvalidInput(err.to_string()),
            VoiceError::Timeout { timeout, .. } => EngineError::Timeout(timeout),
            other => EngineError::Internal(other.to_string()),
        }
    }
}
