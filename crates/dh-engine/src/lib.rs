//! Engine abstraction layer.
//!
//! Defines the uniform contract every speech-recognition, language-model,
//! speech-synthesis and agent backend implements, the per-kind registries
//! that map engine names to constructors, the pool that keeps constructed
//! engines warm, and the resilience helpers (retry with backoff, the
//! content-addressed audio cache) wrapped around provider calls.
//!
//! Provider adapters live in `dh-voice`; this crate never talks to a vendor.

pub mod cache;
pub mod config;
pub mod contract;
pub mod error;
pub mod pool;
pub mod registry;
pub mod retry;

pub use cache::{AudioCache, DEFAULT_CACHE_TTL};
pub use config::EngineConfig;
pub use contract::{
    first_input, joined_text, AgentEngine, AgentRequestContext, AsrEngine, AsrOptions, Engine,
    EngineHandle, EngineKind, LlmEngine, TtsEngine, TtsOptions,
};
pub use error::EngineError;
pub use pool::EnginePool;
pub use registry::{EngineRegistries, Registry};
pub use retry::{retry, RetryPolicy};
