//! Fountain Disperser - multi-chain gas dispersal service
//!
//! Accepts confirmed deposit events, fans each deposit out into one drip
//! transaction per destination chain, and serves intent status and history.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use fountain_disperser::api;
use fountain_disperser::chain::{self, EvmChainGateway};
use fountain_disperser::config::{Settings, StoreBackend};
use fountain_disperser::coordination::DispersalOrchestrator;
use fountain_disperser::metrics::{self, MetricsServer};
use fountain_disperser::state::{IntentStore, MemoryIntentStore, PostgresIntentStore};
use fountain_disperser::tx::PercentageBump;

/// Bound on how long shutdown waits for in-flight chain workers
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Fountain Disperser v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize intent store
    let store: Arc<dyn IntentStore> = match settings.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory intent store, state is lost on restart");
            Arc::new(MemoryIntentStore::new())
        }
        StoreBackend::Postgres => {
            let database = settings
                .database
                .as_ref()
                .context("postgres backend requires a [database] section")?;
            let store =
                PostgresIntentStore::new(database, settings.store.max_patch_attempts).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            Arc::new(store)
        }
    };

    // Initialize chain gateway (providers are created on first use)
    let registry = Arc::new(settings.chain_registry());
    let wallet = chain::load_wallet(&settings.wallet)?;
    let fee_policy = Arc::new(PercentageBump::new(
        settings.dispersal.fee_bump_percent,
        settings.dispersal.gas_limit,
    ));
    let gateway = Arc::new(EvmChainGateway::new(
        registry.clone(),
        wallet,
        fee_policy,
        &settings.dispersal,
    ));
    info!("Chain gateway initialized for chains {:?}", registry.chain_ids());

    // Initialize orchestrator
    let orchestrator = Arc::new(DispersalOrchestrator::new(
        store.clone(),
        gateway.clone(),
        registry,
        settings.dispersal.clone(),
    ));

    // Start API server
    let (api_stop_tx, api_stop_rx) = oneshot::channel::<()>();
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let orchestrator = orchestrator.clone();
        async move {
            let stop = async {
                let _ = api_stop_rx.await;
            };
            if let Err(e) = api::run_server(config, orchestrator, stop).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let gateway = gateway.clone();
        let store = store.clone();
        let interval = settings.dispersal.health_check_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                // Check chain connections
                for (chain_id, healthy) in gateway.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain_id);
                    }
                }

                // Check store
                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                }
            }
        }
    });

    info!("Fountain Disperser is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Stop taking new deposits, then let in-flight chain workers finish
    let _ = api_stop_tx.send(());
    if let Err(e) = api_handle.await {
        error!("API task ended abnormally: {}", e);
    }

    let outstanding = orchestrator.supervisor().outstanding();
    if outstanding > 0 {
        info!("Waiting for {} outstanding chain workers", outstanding);
    }
    if !orchestrator
        .supervisor()
        .wait_idle(SHUTDOWN_DRAIN_TIMEOUT)
        .await
    {
        for task in orchestrator.supervisor().snapshot() {
            warn!(
                intent_id = %task.intent_id,
                chain_id = task.chain_id,
                stage = ?task.stage,
                "Abandoning worker at shutdown"
            );
        }
    }

    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }
    metrics::set_outstanding_tasks(orchestrator.supervisor().outstanding());

    info!("Fountain Disperser stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,fountain_disperser=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("DISPERSER_LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
