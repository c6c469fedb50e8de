//! Background tasks for the digital-human server.
//!
//! Includes:
//! - Dropping conversation contexts idle beyond their maximum age.
//! - Sweeping expired entries out of the audio cache.

use crate::config::{CacheConfig, ContextsConfig};
use crate::AppState;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Starts the stale-context sweep.
///
/// Runs indefinitely. Contexts whose last access is older than
/// `max_age_hours` are removed; contexts in use by a turn are skipped.
pub async fn start_context_sweep(state: Arc<AppState>, config: ContextsConfig) {
    if config.sweep_interval_secs == 0 {
        tracing::warn!("context sweep disabled (sweep_interval_secs=0)");
        return;
    }

    let interval = Duration::from_secs(config.sweep_interval_secs);
    let max_age = config.max_age();

    tracing::info!(
        interval_secs = config.sweep_interval_secs,
        max_age_hours = config.max_age_hours,
        "starting context sweep task"
    );

    loop {
        sleep(interval).await;

        let removed = state.contexts.clear_old_contexts(max_age).await;
        if removed > 0 {
            let remaining = state.contexts.len().await;
            tracing::info!(
                count = removed,
                remaining = remaining,
                "removed stale conversation contexts"
            );
        }
    }
}

/// Starts the audio cache sweep. Returns immediately when the cache is
/// disabled.
pub async fn start_cache_sweep(state: Arc<AppState>, config: CacheConfig) {
    let Some(cache) = state.pipeline.cache().cloned() else {
        tracing::debug!("audio cache disabled, no sweep task");
        return;
    };
    if config.sweep_interval_secs == 0 {
        tracing::warn!("cache sweep disabled (sweep_interval_secs=0)");
        return;
    }

    let interval = Duration::from_secs(config.sweep_interval_secs);
    tracing::info!(
        interval_secs = config.sweep_interval_secs,
        dir = %cache.dir().display(),
        "starting audio cache sweep task"
    );

    loop {
        sleep(interval).await;

        let removed = cache.sweep().await;
        if removed > 0 {
            tracing::info!(count = removed, "swept expired audio cache entries");
        }
    }
}
