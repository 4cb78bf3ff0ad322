//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use prometheus::Registry;

use crate::pool::Pool;

use super::backend::{SignerBackend, StubBackend};
use super::responder::{UnlockResponder, UnlockResponderConfig};

/// State shared across request handlers. All fields are cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn SignerBackend>,
    pub responder: Arc<UnlockResponder>,
    /// Present when the process runs against a real enclave pool; drives the
    /// health endpoint.
    pub pool: Option<Pool>,
    pub registry: Arc<Registry>,
}

impl AppState {
    pub fn new(
        backend: Arc<dyn SignerBackend>,
        responder: Arc<UnlockResponder>,
        pool: Option<Pool>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            backend,
            responder,
            pool,
            registry,
        }
    }
}

impl Default for AppState {
    /// Stub-backed state without a pool, suitable for tests.
    fn default() -> Self {
        Self::new(
            Arc::new(StubBackend),
            Arc::new(UnlockResponder::new(UnlockResponderConfig::default())),
            None,
            Arc::new(Registry::new()),
        )
    }
}
