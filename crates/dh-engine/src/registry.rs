//! Name-to-constructor registries, one per engine kind.
//!
//! Registries are filled once at startup (see `dh_voice::register_builtin`)
//! and then shared read-only. Registering the same name twice is a startup
//! error rather than a silent override.

use crate::config::EngineConfig;
use crate::contract::{AgentEngine, AsrEngine, EngineHandle, EngineKind, LlmEngine, TtsEngine};
use crate::error::EngineError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type Constructor<T> = Arc<dyn Fn(&EngineConfig) -> Result<Arc<T>, EngineError> + Send + Sync>;

struct Registration<T: ?Sized> {
    required_keys: Vec<String>,
    constructor: Constructor<T>,
}

/// Registry for one engine kind.
pub struct Registry<T: ?Sized> {
    kind: EngineKind,
    entries: BTreeMap<String, Registration<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Registers `constructor` under `name`.
    ///
    /// `required_keys` are checked against the engine config before the
    /// constructor runs, so constructors may assume they are present.
    pub fn register<F>(
        &mut self,
        name: &str,
        required_keys: &[&str],
        constructor: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(&EngineConfig) -> Result<Arc<T>, EngineError> + Send + Sync + 'static,
    {
        if self.entries.contains_key(name) {
            return Err(EngineError::DuplicateEngine {
                kind: self.kind,
                name: name.to_string(),
            });
        }
        self.entries.insert(
            name.to_string(),
            Registration {
                required_keys: required_keys.iter().map(|k| k.to_string()).collect(),
                constructor: Arc::new(constructor),
            },
        );
        tracing::debug!(kind = %self.kind, engine = name, "registered engine");
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn required_keys(&self, name: &str) -> Option<&[String]> {
        self.entries.get(name).map(|r| r.required_keys.as_slice())
    }

    /// Constructs the engine named by `config.name`.
    ///
    /// Fails with `UnknownEngine` (listing what is registered) or
    /// `MissingKey` before the constructor is invoked.
    pub fn create(&self, config: &EngineConfig) -> Result<Arc<T>, EngineError> {
        let registration =
            self.entries
                .get(&config.name)
                .ok_or_else(|| EngineError::UnknownEngine {
                    kind: self.kind,
                    name: config.name.clone(),
                    available: self.names(),
                })?;

        if let Some(key) = config.first_missing(registration.required_keys.as_slice()) {
            return Err(EngineError::MissingKey {
                engine: config.name.clone(),
                key: key.to_string(),
            });
        }

        (registration.constructor)(config)
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("engines", &self.names())
            .finish()
    }
}

/// The four per-kind registries.
#[derive(Debug)]
pub struct EngineRegistries {
    pub asr: Registry<dyn AsrEngine>,
    pub llm: Registry<dyn LlmEngine>,
    pub tts: Registry<dyn TtsEngine>,
    pub agent: Registry<dyn AgentEngine>,
}

impl Default for EngineRegistries {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRegistries {
    pub fn new() -> Self {
        Self {
            asr: Registry::new(EngineKind::Asr),
            llm: Registry::new(EngineKind::Llm),
            tts: Registry::new(EngineKind::Tts),
            agent: Registry::new(EngineKind::Agent),
        }
    }

    /// Constructs an engine of `kind` from `config`.
    pub fn create(
        &self,
        kind: EngineKind,
        config: &EngineConfig,
    ) -> Result<EngineHandle, EngineError> {
        Ok(match kind {
            EngineKind::Asr => EngineHandle::Asr(self.asr.create(config)?),
            EngineKind::Llm => EngineHandle::Llm(self.llm.create(config)?),
            EngineKind::Tts => EngineHandle::Tts(self.tts.create(config)?),
            EngineKind::Agent => EngineHandle::Agent(self.agent.create(config)?),
        })
    }

    /// Registered names for `kind`, sorted.
    pub fn available(&self, kind: EngineKind) -> Vec<String> {
        match kind {
            EngineKind::Asr => self.asr.names(),
            EngineKind::Llm => self.llm.names(),
            EngineKind::Tts => self.tts.names(),
            EngineKind::Agent => self.agent.names(),
        }
    }
}
