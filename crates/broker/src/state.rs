//! Shared application state for the control API.

use std::sync::Arc;

use floe_store::{CredentialStore, PgStore};

/// State threaded through the axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The durable store.
    pub store: Arc<PgStore>,

    /// Encrypted credential storage.
    pub credentials: CredentialStore,
}

impl AppState {
    /// Create the application state.
    pub fn new(store: Arc<PgStore>, credentials: CredentialStore) -> Self {
        Self { store, credentials }
    }
}
