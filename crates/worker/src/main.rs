//! Floe Worker binary.
//!
//! Leases jobs from the shared queue and executes workflow actions.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use floe_store::{create_pool, CredentialStore, DatabaseConfig, PgStore};
use floe_tools::create_default_registry;
use floe_worker::{WorkerConfig, WorkerRuntime};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,floe_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Floe worker");

    let config = WorkerConfig::from_env();
    tracing::info!(
        worker_id = %config.worker_id,
        pool = %config.pool_name,
        batch = config.batch_size,
        "Worker configuration loaded"
    );

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });
    let pool = create_pool(&db_config).await?;
    let store = Arc::new(PgStore::new(pool.clone()));

    let encryption_key = std::env::var("FLOE_ENCRYPTION_KEY").unwrap_or_else(|_| {
        tracing::warn!("FLOE_ENCRYPTION_KEY not set, generating an ephemeral key");
        floe_store::Encryptor::generate_key_base64()
    });
    let credentials = Arc::new(CredentialStore::new(pool, &encryption_key)?);

    // Register with the worker registry and keep the heartbeat fresh.
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    store
        .register_worker(
            &config.worker_id,
            &config.pool_name,
            Some(&hostname),
            Some(config.max_concurrent as i32),
        )
        .await?;
    tracing::info!(hostname = %hostname, "Worker registered");

    let registry_beat = {
        let store = store.clone();
        let worker_id = config.worker_id.clone();
        let interval = config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.worker_heartbeat(&worker_id).await {
                    tracing::warn!(error = %e, "Worker heartbeat failed");
                }
            }
        })
    };

    let runtime = WorkerRuntime::new(
        config.clone(),
        store.clone(),
        store.clone(),
        credentials,
        Arc::new(create_default_registry()),
    );
    let shutdown = runtime.shutdown_token();

    let shutdown_signal = async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        _ = runtime.run() => {}
        _ = shutdown_signal => {
            shutdown.cancel();
        }
    }

    registry_beat.abort();
    store.deregister_worker(&config.worker_id).await.ok();
    tracing::info!("Worker stopped");
    Ok(())
}
