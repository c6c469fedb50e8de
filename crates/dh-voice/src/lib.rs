//! Provider adapters for the digital-human engines.
//!
//! Each adapter implements one of the `dh-engine` capability traits:
//!
//! | kind  | name       | backend                                   |
//! |-------|------------|-------------------------------------------|
//! | asr   | `deepgram` | Deepgram pre-recorded REST API            |
//! | asr   | `whisper`  | local whisper.cpp binary                  |
//! | llm   | `openai`   | OpenAI chat completions                   |
//! | llm   | `minimax`  | MiniMax OpenAI-compatible chat completion |
//! | tts   | `minimax`  | MiniMax T2A v2                            |
//! | tts   | `piper`    | local Piper binary                        |
//! | agent | `openai`   | tool-calling loop with document search    |
//!
//! The talking-head video collaborator (EchoMimic) lives in [`video`].

pub mod agent;
pub mod asr;
pub mod documents;
pub mod error;
mod http;
pub mod llm;
mod openai;
mod subprocess;
pub mod tts;
pub mod video;

pub use agent::OpenAiAgent;
pub use asr::{DeepgramAsr, WhisperCliAsr};
pub use error::VoiceError;
pub use llm::OpenAiLlm;
pub use tts::{MiniMaxTts, PiperTts};
pub use video::{EchoMimicGenerator, EchoMimicSettings, VideoGenerator, VideoOutcome, VideoParams};

use dh_engine::{AgentEngine, AsrEngine, EngineError, EngineRegistries, LlmEngine, TtsEngine};
use std::sync::Arc;

/// Registers every built-in adapter under its canonical name.
pub fn register_builtin(registries: &mut EngineRegistries) -> Result<(), EngineError> {
    registries.asr.register("deepgram", &["api_key"], |config| {
        Ok(Arc::new(DeepgramAsr::from_config(config)?) as Arc<dyn AsrEngine>)
    })?;
    registries.asr.register("whisper", &["model_path"], |config| {
        Ok(Arc::new(WhisperCliAsr::from_config(config)?) as Arc<dyn AsrEngine>)
    })?;

    registries.llm.register("openai", &["api_key", "model"], |config| {
        Ok(Arc::new(OpenAiLlm::from_config(config)?) as Arc<dyn LlmEngine>)
    })?;
    registries.llm.register("minimax", &["api_key", "model", "group_id"], |config| {
        Ok(Arc::new(OpenAiLlm::minimax(config)?) as Arc<dyn LlmEngine>)
    })?;

    registries.tts.register("minimax", &["api_key", "group_id"], |config| {
        Ok(Arc::new(MiniMaxTts::from_config(config)?) as Arc<dyn TtsEngine>)
    })?;
    registries.tts.register("piper", &["voice"], |config| {
        Ok(Arc::new(PiperTts::from_config(config)?) as Arc<dyn TtsEngine>)
    })?;

    registries.agent.register("openai", &["api_key", "model"], |config| {
        Ok(Arc::new(OpenAiAgent::from_config(config)?) as Arc<dyn AgentEngine>)
    })?;
    Ok(())
}
