// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use angel_db::Store;

use crate::provider::ModelProvider;
use crate::registry::StreamRegistry;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// Storage core: catalog, attach pool, watcher.
    pub store: Store,
    /// In-flight model calls, at most one per main session.
    pub streams: StreamRegistry,
    /// The configured LLM adapter, if any. Without one, message operations
    /// persist and acknowledge but no model call runs.
    pub provider: Option<Arc<dyn ModelProvider>>,
}

impl AppState {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            store,
            streams: StreamRegistry::new(),
            provider: None,
        })
    }

    pub fn with_provider(store: Store, provider: Arc<dyn ModelProvider>) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            store,
            streams: StreamRegistry::new(),
            provider: Some(provider),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
