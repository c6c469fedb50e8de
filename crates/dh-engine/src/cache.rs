//! Content-addressed cache for synthesized speech.
//!
//! Each entry is two files in the cache directory: `<key>.bin` holding the
//! audio bytes and `<key>.json` holding the format metadata. An entry is
//! valid while its `.bin` modification time is within the TTL; expired
//! entries are deleted when read and by [`AudioCache::sweep`].

use crate::error::EngineError;
use dh_types::{AudioFormat, AudioMessage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Seven days.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    format: AudioFormat,
    sample_rate: u32,
    sample_width: u16,
}

#[derive(Debug, Clone)]
pub struct AudioCache {
    dir: PathBuf,
    ttl: Duration,
}

impl AudioCache {
    /// Opens (creating if needed) a cache rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, EngineError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            EngineError::Config(format!(
                "cannot create audio cache directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir, ttl })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Hex SHA-256 over `text:voice_id`, followed by `:k=v` for each param
    /// in key order.
    pub fn content_key(text: &str, voice_id: &str, params: &BTreeMap<String, String>) -> String {
        let mut material = format!("{text}:{voice_id}");
        for (k, v) in params {
            material.push(':');
            material.push_str(k);
            material.push('=');
            material.push_str(v);
        }
        hex::encode(Sha256::digest(material.as_bytes()))
    }

    /// Returns the cached audio for `key` if present and fresh.
    ///
    /// Read failures are logged and reported as a miss.
    pub async fn get_cached_audio(&self, key: &str) -> Option<AudioMessage> {
        if !is_valid_key(key) {
            tracing::warn!(key, "rejecting malformed cache key");
            return None;
        }
        let (bin, json) = self.paths(key);

        let modified = match tokio::fs::metadata(&bin).await {
            Ok(meta) => meta.modified().ok()?,
            Err(_) => return None,
        };
        if self.is_expired(modified) {
            tracing::debug!(key, "cache entry expired, removing");
            remove_entry(&bin, &json).await;
            return None;
        }

        let meta: EntryMeta = match tokio::fs::read(&json).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(key, "corrupt cache metadata, removing entry: {}", e);
                    remove_entry(&bin, &json).await;
                    return None;
                }
            },
            Err(e) => {
                tracing::warn!(key, "failed to read cache metadata: {}", e);
                return None;
            }
        };

        match tokio::fs::read(&bin).await {
            Ok(data) => Some(AudioMessage::new(
                data,
                meta.format,
                meta.sample_rate,
                meta.sample_width,
            )),
            Err(e) => {
                tracing::warn!(key, "failed to read cached audio: {}", e);
                None
            }
        }
    }

    /// Stores `audio` under `key`. Returns whether the write succeeded;
    /// failures are logged and never propagated.
    pub async fn save_to_cache(&self, key: &str, audio: &AudioMessage) -> bool {
        if !is_valid_key(key) {
            tracing::warn!(key, "rejecting malformed cache key");
            return false;
        }
        match self.write_entry(key, audio).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, "failed to write cache entry: {}", e);
                false
            }
        }
    }

    async fn write_entry(&self, key: &str, audio: &AudioMessage) -> std::io::Result<()> {
        let (bin, json) = self.paths(key);
        let meta = EntryMeta {
            format: audio.format,
            sample_rate: audio.sample_rate,
            sample_width: audio.sample_width,
        };
        let meta = serde_json::to_vec(&meta).map_err(std::io::Error::other)?;
        tokio::fs::write(&json, meta).await?;

        // Audio goes in last, through a rename, so readers never see a
        // partially written .bin.
        let tmp = self.dir.join(format!("{key}.bin.tmp"));
        tokio::fs::write(&tmp, &audio.data).await?;
        tokio::fs::rename(&tmp, &bin).await
    }

    /// Deletes every expired entry. Returns the number removed.
    pub async fn sweep(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), "failed to scan audio cache: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("error while scanning audio cache: {}", e);
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            if self.is_expired(modified) {
                remove_entry(&path, &path.with_extension("json")).await;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "swept expired audio cache entries");
        }
        removed
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{key}.bin")),
            self.dir.join(format!("{key}.json")),
        )
    }

    fn is_expired(&self, modified: SystemTime) -> bool {
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age > self.ttl)
            .unwrap_or(false)
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn remove_entry(bin: &Path, json: &Path) {
    for path in [bin, json] {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), "failed to remove cache file: {}", e);
            }
        }
    }
}
