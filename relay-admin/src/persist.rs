//! File-based persistence for standalone mode.
//!
//! On every write (PUT/DELETE route, upstream, consumer) the current in-memory
//! state is serialized to a JSON file.  On startup the file is loaded back into
//! the ConfigCache so data survives restarts.
//!
//! The file is written atomically: first to a `.tmp` sibling, then renamed
//! over the final path, so a crash mid-write never corrupts the stored state.
//!
//! The implementation is a no-op when `AdminState::state_file` is `None`
//! (e.g. in unit tests that build an `AdminState` without specifying a path).

use crate::server::AdminState;
use relay_core::consumer::Consumer;
use relay_core::route::Route;
use relay_core::service::Service;
use relay_core::upstream::Upstream;
use relay_store::cache::ConfigCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// The shape serialized to / deserialized from the state file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub routes: HashMap<String, Route>,
    #[serde(default)]
    pub services: HashMap<String, Service>,
    #[serde(default)]
    pub upstreams: HashMap<String, Upstream>,
    #[serde(default)]
    pub consumers: HashMap<String, Consumer>,
}

/// Save the current `ConfigCache` contents to `state.state_file`.
///
/// Returns immediately (no-op) if `state_file` is `None`.
/// Logs a warning rather than panicking on I/O errors.
pub fn save_state(state: &AdminState) {
    let path = match &state.state_file {
        Some(p) => p.clone(),
        None => return,
    };

    // Snapshot the four maps
    let persisted = PersistedState {
        routes: state
            .cache
            .routes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect(),
        services: state
            .cache
            .services
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect(),
        upstreams: state
            .cache
            .upstreams
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect(),
        consumers: state
            .cache
            .consumers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect(),
    };

    // Serialize
    let json = match serde_json::to_string_pretty(&persisted) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "persist: failed to serialize state");
            return;
        }
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::warn!(error = %e, dir = %parent.display(), "persist: failed to create state dir");
        return;
    }

    // Atomic write: tmp file → rename
    let tmp = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp, &json) {
        tracing::warn!(error = %e, path = %tmp.display(), "persist: failed to write tmp file");
        return;
    }
    if let Err(e) = std::fs::rename(&tmp, &path) {
        tracing::warn!(error = %e, "persist: failed to rename tmp → state file");
        return;
    }

    tracing::debug!(path = %path.display(), "persist: state saved");
}

/// Load a previously saved state file into `cache`.
///
/// * If the file does not exist            → silently returns (first run).
/// * If the file exists but is malformed   → logs a warning and returns.
/// * On success                            → cache is populated and the consumer
///   key index is rebuilt.
pub fn load_state(path: &Path, cache: &ConfigCache) {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "persist: no state file found, starting fresh");
        return;
    }

    let data = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "persist: failed to read state file");
            return;
        }
    };

    let persisted: PersistedState = match serde_json::from_str(&data) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "persist: state file is malformed, ignoring");
            return;
        }
    };

    let routes_count = persisted.routes.len();
    let services_count = persisted.services.len();
    let upstreams_count = persisted.upstreams.len();
    let consumers_count = persisted.consumers.len();

    for (k, v) in persisted.routes {
        cache.routes.insert(k, v);
    }
    for (k, v) in persisted.services {
        cache.services.insert(k, v);
    }
    for (k, v) in persisted.upstreams {
        cache.upstreams.insert(k, v);
    }
    for (k, v) in persisted.consumers {
        cache.consumers.insert(k, v);
    }
    cache.rebuild_consumer_key_index();

    tracing::info!(
        routes = routes_count,
        services = services_count,
        upstreams = upstreams_count,
        consumers = consumers_count,
        path = %path.display(),
        "persist: state restored from file"
    );
}

/// Convenience wrapper that accepts `Option<Arc<std::path::PathBuf>>` or similar.
/// Used internally — call `save_state(state)` directly from handlers.
pub fn load_state_opt(path: Option<&Path>, cache: &ConfigCache) {
    if let Some(p) = path {
        load_state(p, cache);
    }
}
