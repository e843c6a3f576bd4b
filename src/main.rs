//! Wallet transaction orchestrator daemon
//!
//! Connects to the configured chains and the order API, then resumes
//! watching every transaction a previous run left unsettled.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use wallet_tx_orchestrator::chain::ChainManager;
use wallet_tx_orchestrator::config::Settings;
use wallet_tx_orchestrator::metrics;
use wallet_tx_orchestrator::orders::HttpOrderApi;
use wallet_tx_orchestrator::state::{MemoryStore, PgTransactionStore, TransactionStore};
use wallet_tx_orchestrator::tx::LocalWalletSigner;
use wallet_tx_orchestrator::TransactionLifecycle;

const DEFAULT_KEY_ENV: &str = "WALLET_PRIVATE_KEY";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting wallet transaction orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let store: Arc<dyn TransactionStore> = match &settings.database {
        Some(database) => {
            let store = PgTransactionStore::new(database).await?;
            store.run_migrations().await?;
            store.health_check().await?;
            info!("Database connection established");
            Arc::new(store)
        }
        None => {
            warn!("No database configured, records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let chains = Arc::new(ChainManager::new(&settings).await?);
    info!("Chain connections initialized: {:?}", chains.connected_chains());

    let key_env = settings
        .wallet
        .as_ref()
        .and_then(|w| w.private_key_env.clone())
        .unwrap_or_else(|| DEFAULT_KEY_ENV.to_string());
    let signer = Arc::new(LocalWalletSigner::from_env(&key_env)?);

    let order_api = Arc::new(HttpOrderApi::new(&settings.order_api)?);

    let lifecycle = Arc::new(TransactionLifecycle::new(
        &settings.orchestrator,
        store,
        chains,
        signer,
        order_api,
    ));
    lifecycle.start().await;

    let resumed = lifecycle.resume_incomplete().await?;
    info!("Orchestrator is running");

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    lifecycle.stop().await;
    for handle in resumed {
        handle.abort();
    }

    info!("Final metrics:\n{}", metrics::render());
    info!("Orchestrator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,wallet_tx_orchestrator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
