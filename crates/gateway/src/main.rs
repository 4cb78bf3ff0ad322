//! `signer-gateway` — binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise telemetry (structured JSON logs).
//! 3. Build the Prometheus registry and subsystem metrics.
//! 4. Build the enclave connection pool and register targets.
//! 5. Build the sticky selector and the enclave backend.
//! 6. Build the unlock dispatcher (KMS executor when configured) and the
//!    unlock responder.
//! 7. Build the Axum router and serve until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::Registry;
use tracing::{info, warn};

use signer_gateway::api::{
    http, AppState, EnclaveBackend, StickySelector, UnlockResponder, UnlockResponderConfig,
};
use signer_gateway::config::Config;
use signer_gateway::kms::mock::{StaticAttestor, StaticProvider};
use signer_gateway::kms::{KmsClient, KmsConfig};
use signer_gateway::pool::{Pool, PoolMetrics};
use signer_gateway::telemetry;
use signer_gateway::unlock::{
    Dispatcher, KmsExecutor, NoopExecutor, UnlockExecutor, UnlockMetrics,
};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cfg.listen_addr,
        "signer-gateway starting"
    );

    // -----------------------------------------------------------------------
    // 3. Metrics
    // -----------------------------------------------------------------------
    let registry = Arc::new(Registry::new());
    let pool_metrics = Arc::new(PoolMetrics::new(&registry)?);
    let unlock_metrics = Arc::new(UnlockMetrics::new(&registry)?);

    // -----------------------------------------------------------------------
    // 4. Connection pool
    // -----------------------------------------------------------------------
    let targets = cfg.parse_targets()?;
    let pool = Pool::new(cfg.pool_config(), pool_metrics)?;
    for target in &targets {
        info!(enclave = %target.id, endpoint = %target.endpoint, "registering enclave target");
        pool.register_target(target.clone());
    }

    // -----------------------------------------------------------------------
    // 5. Selector + backend
    // -----------------------------------------------------------------------
    let target_ids: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
    let selector = Arc::new(StickySelector::new(target_ids)?);
    let backend = Arc::new(EnclaveBackend::with_call_timeout(
        pool.clone(),
        selector,
        cfg.pool_config().call_timeout,
    ));

    // -----------------------------------------------------------------------
    // 6. Unlock dispatcher + responder
    // -----------------------------------------------------------------------
    let executor = build_unlock_executor(&cfg)?;
    let dispatcher = Dispatcher::new(cfg.unlock_config(), executor, unlock_metrics);
    let responder = Arc::new(UnlockResponder::new(UnlockResponderConfig {
        queue: Some(Arc::new(dispatcher.clone())),
        keyspace: cfg.unlock_keyspace.clone(),
        min_retry: std::time::Duration::from_millis(cfg.unlock_retry_min_ms),
        max_retry: std::time::Duration::from_millis(cfg.unlock_retry_max_ms),
    }));

    // -----------------------------------------------------------------------
    // 7. HTTP server
    // -----------------------------------------------------------------------
    let state = AppState::new(backend, responder, Some(pool.clone()), registry);
    let router = http::build(state);
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen_addr))?;
    info!(addr = %cfg.listen_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    dispatcher.shutdown().await;
    pool.close();
    Ok(())
}

/// Pick the unlock executor: KMS-backed when mock key material is
/// configured, otherwise a logged no-op.
fn build_unlock_executor(cfg: &Config) -> Result<Arc<dyn UnlockExecutor>> {
    match cfg.unlock_kms_mock_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => {
            let provider = Arc::new(StaticProvider::new(key.as_bytes().to_vec()));
            let attestor = Arc::new(StaticAttestor::default());
            let client = KmsClient::new(provider, attestor, KmsConfig::default())?;
            Ok(Arc::new(KmsExecutor::new(Arc::new(client))))
        }
        _ => {
            warn!("UNLOCK_KMS_MOCK_KEY not set; unlock executor degraded to no-op");
            Ok(Arc::new(NoopExecutor))
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
