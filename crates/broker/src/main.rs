//! Floe Broker binary.
//!
//! Runs the dispatch loop, the queue reaper, and the control API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use floe_broker::{api, AppState, BrokerConfig, Dispatcher};
use floe_store::{create_pool, ensure_schema, CredentialStore, DatabaseConfig, Encryptor, PgStore};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,floe_broker=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn encryption_key() -> String {
    std::env::var("FLOE_ENCRYPTION_KEY").unwrap_or_else(|_| {
        tracing::warn!("FLOE_ENCRYPTION_KEY not set, generating an ephemeral key");
        Encryptor::generate_key_base64()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Floe broker");

    let config = BrokerConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load broker config, using defaults");
        BrokerConfig::default()
    });
    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });

    let pool = create_pool(&db_config).await?;
    ensure_schema(&pool).await?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let credentials = CredentialStore::new(pool, &encryption_key())?;

    // Dispatch loop
    let dispatcher = Dispatcher::new(store.clone(), config.clone());
    tracing::info!(broker_id = %dispatcher.broker_id(), "Dispatcher identity assigned");
    let dispatch_handle = tokio::spawn(async move { dispatcher.run().await });

    // Queue reaper
    let reap_handle = tokio::spawn(floe_broker::dispatcher::reap_loop(
        store.clone(),
        Duration::from_secs(config.reap_interval),
    ));

    // Worker registry sweep
    let sweep_handle = {
        let store = store.clone();
        let stale_after = Duration::from_secs(config.worker_stale_after);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stale_after / 2);
            loop {
                ticker.tick().await;
                match store.cleanup_stale_workers(stale_after).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "Removed stale workers"),
                    Err(err) => tracing::warn!(error = %err, "Worker sweep failed"),
                }
            }
        })
    };

    // Control API
    let state = AppState::new(store, credentials);
    let app = api::build_router(state);
    let addr: SocketAddr = config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatch_handle.abort();
    reap_handle.abort();
    sweep_handle.abort();
    tracing::info!("Broker shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
