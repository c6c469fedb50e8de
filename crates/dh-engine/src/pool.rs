//! Lazily-constructed, shared engine instances.
//!
//! The pool owns the catalog of configured engines and builds each
//! `(kind, name)` pair at most once, on first use. Concurrent first requests
//! for the same pair wait on a single construction.

use crate::config::EngineConfig;
use crate::contract::{AgentEngine, AsrEngine, EngineHandle, EngineKind, LlmEngine, TtsEngine};
use crate::error::EngineError;
use crate::registry::EngineRegistries;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

type SlotKey = (EngineKind, String);

pub struct EnginePool {
    registries: Arc<EngineRegistries>,
    catalog: HashMap<SlotKey, EngineConfig>,
    slots: Mutex<HashMap<SlotKey, Arc<OnceCell<EngineHandle>>>>,
}

impl EnginePool {
    /// Creates a pool over `registries` with the configured engine blocks.
    ///
    /// Nothing is constructed here.
    pub fn new(
        registries: Arc<EngineRegistries>,
        configs: impl IntoIterator<Item = (EngineKind, EngineConfig)>,
    ) -> Self {
        let catalog = configs
            .into_iter()
            .map(|(kind, config)| ((kind, config.name.clone()), config))
            .collect();
        Self {
            registries,
            catalog,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn registries(&self) -> &EngineRegistries {
        &self.registries
    }

    /// The configuration block for `(kind, name)`, if one was supplied.
    pub fn config(&self, kind: EngineKind, name: &str) -> Option<&EngineConfig> {
        self.catalog.get(&(kind, name.to_string()))
    }

    /// Returns the shared engine for `(kind, name)`, constructing it on
    /// first request.
    ///
    /// An engine with no configuration block is built from an empty one, so
    /// engines without required keys work unconfigured and unknown names
    /// surface the registry's `UnknownEngine` error. A failed construction
    /// is not cached; the next request retries it.
    pub async fn get(&self, kind: EngineKind, name: &str) -> Result<EngineHandle, EngineError> {
        let key = (kind, name.to_string());
        let fallback;
        let config = match self.catalog.get(&key) {
            Some(config) => config,
            None => {
                fallback = EngineConfig::new(name);
                &fallback
            }
        };
        if !config.enabled {
            return Err(EngineError::Disabled {
                kind,
                name: name.to_string(),
            });
        }

        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(key).or_default().clone()
        };

        let handle = slot
            .get_or_try_init(|| async {
                let handle = self.registries.create(kind, config)?;
                tracing::info!(kind = %kind, engine = name, "engine initialized");
                Ok::<_, EngineError>(handle)
            })
            .await?;
        Ok(handle.clone())
    }

    pub async fn asr(&self, name: &str) -> Result<Arc<dyn AsrEngine>, EngineError> {
        match self.get(EngineKind::Asr, name).await? {
            EngineHandle::Asr(engine) => Ok(engine),
            other => Err(mismatch(EngineKind::Asr, &other)),
        }
    }

    pub async fn llm(&self, name: &str) -> Result<Arc<dyn LlmEngine>, EngineError> {
        match self.get(EngineKind::Llm, name).await? {
            EngineHandle::Llm(engine) => Ok(engine),
            other => Err(mismatch(EngineKind::Llm, &other)),
        }
    }

    pub async fn tts(&self, name: &str) -> Result<Arc<dyn TtsEngine>, EngineError> {
        match self.get(EngineKind::Tts, name).await? {
            EngineHandle::Tts(engine) => Ok(engine),
            other => Err(mismatch(EngineKind::Tts, &other)),
        }
    }

    pub async fn agent(&self, name: &str) -> Result<Arc<dyn AgentEngine>, EngineError> {
        match self.get(EngineKind::Agent, name).await? {
            EngineHandle::Agent(engine) => Ok(engine),
            other => Err(mismatch(EngineKind::Agent, &other)),
        }
    }

    /// Pairs that currently hold a constructed engine, sorted.
    pub async fn initialized(&self) -> Vec<(EngineKind, String)> {
        let slots = self.slots.lock().await;
        let mut keys: Vec<SlotKey> = slots
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Releases every constructed engine and empties the pool.
    ///
    /// A failing release does not stop the others; all failures are
    /// returned after every engine has been visited.
    pub async fn close_all(&self) -> Vec<(EngineKind, String, EngineError)> {
        let drained: Vec<(SlotKey, Arc<OnceCell<EngineHandle>>)> = {
            let mut slots = self.slots.lock().await;
            slots.drain().collect()
        };

        let mut failures = Vec::new();
        for ((kind, name), slot) in drained {
            let Some(handle) = slot.get() else {
                continue;
            };
            match handle.release().await {
                Ok(()) => tracing::debug!(kind = %kind, engine = %name, "engine released"),
                Err(e) => {
                    tracing::error!(kind = %kind, engine = %name, "failed to release engine: {}", e);
                    failures.push((kind, name, e));
                }
            }
        }
        failures
    }
}

fn mismatch(expected: EngineKind, got: &EngineHandle) -> EngineError {
    EngineError::Internal(format!(
        "pool slot for {expected} engine '{}' holds a {} engine",
        got.name(),
        got.kind()
    ))
}
