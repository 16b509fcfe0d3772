//! Shared application state

use std::sync::Arc;

use crate::{
    config::Config,
    db::InMemoryResourceStore,
    payload::{InMemoryPayloadStore, PayloadStore},
    services::OperationExecutor,
};

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: InMemoryResourceStore,
    pub payloads: Arc<dyn PayloadStore>,
    pub operations: Arc<OperationExecutor>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_payload_store(config, Arc::new(InMemoryPayloadStore::new()))
    }

    /// State backed by a caller-provided payload store.
    pub fn with_payload_store(config: Config, payloads: Arc<dyn PayloadStore>) -> Self {
        let store = InMemoryResourceStore::new();
        let operations = Arc::new(OperationExecutor::new(store.clone()));

        tracing::info!(
            offload_enabled = config.bundle.payload.offload_enabled,
            compensate_on_abort = config.bundle.payload.compensate_on_abort,
            max_entries = config.bundle.max_entries,
            "Application state initialized"
        );

        Self {
            config: Arc::new(config),
            store,
            payloads,
            operations,
        }
    }
}
