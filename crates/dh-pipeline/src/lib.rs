//! Conversation orchestration.
//!
//! [`ConversationPipeline`] sequences ASR, then LLM or Agent, then TTS for a
//! single turn and never fails across its boundary: stage failures land in
//! [`PipelineResult::error`]. [`ContextManager`] owns per-session history
//! and serializes turns on the same context. [`realtime`] buffers streamed
//! audio for recognition on a persistent connection.

pub mod context;
pub mod conversation;
pub mod realtime;

pub use context::{
    merge_agent_context, ContextHandle, ContextManager, ContextSnapshot, ConversationContext,
};
pub use conversation::{
    ConversationPipeline, FailureKind, PipelineResult, PipelineSettings, ProcessRequest,
    StageOverrides,
};
pub use realtime::{BufferedTranscription, TranscriptionSession};
