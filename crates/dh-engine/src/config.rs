//! Per-engine configuration blocks.

use crate::error::EngineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

fn default_enabled() -> bool {
    true
}

/// Configuration for one named engine.
///
/// Everything other than `name` and `enabled` lands in `params`, so each
/// adapter can declare its own keys without the loader knowing about them.
/// In TOML:
///
/// ```toml
/// [[engines.llm]]
/// name = "openai"
/// api_key = "sk-..."
/// model = "gpt-4o-mini"
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Map<String, Value> = self
            .params
            .iter()
            .map(|(k, v)| {
                if is_secret_key(k) {
                    (k.clone(), Value::String("[REDACTED]".into()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();
        f.debug_struct("EngineConfig")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("params", &params)
            .finish()
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("key") || key.contains("secret") || key.contains("token")
}

impl EngineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            params: Map::new(),
        }
    }

    /// Sets a parameter, returning the config.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns a non-empty string parameter.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(Value::as_f64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }

    /// A key counts as present when it is set to anything other than null
    /// or a blank string.
    pub fn has(&self, key: &str) -> bool {
        match self.params.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }

    /// Returns the first key from `required` that is not present.
    pub fn first_missing<'a, S: AsRef<str>>(&self, required: &'a [S]) -> Option<&'a str> {
        required
            .iter()
            .map(AsRef::as_ref)
            .find(|key| !self.has(key))
    }

    /// Deserializes the parameters into an adapter-specific settings struct.
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_value(Value::Object(self.params.clone()))
            .map_err(|e| EngineError::Config(format!("[{}] {e}", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_strings_count_as_missing() {
        let config = EngineConfig::new("openai")
            .with_param("api_key", "   ")
            .with_param("model", "gpt-4o-mini");
        assert_eq!(config.first_missing(&["model", "api_key"][..]), Some("api_key"));
        assert!(config.get_str("api_key").is_none());
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = EngineConfig::new("deepgram").with_param("api_key", "dg-secret");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("dg-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn flattened_params_from_toml_shape() {
        let value = serde_json::json!({
            "name": "minimax",
            "group_id": "g-1",
            "speed": 1.25
        });
        let config: EngineConfig = serde_json::from_value(value).unwrap();
        assert!(config.enabled);
        assert_eq!(config.get_str("group_id"), Some("g-1"));
        assert_eq!(config.get_f64("speed"), Some(1.25));
        assert!(!config.params.contains_key("name"));
    }
}
