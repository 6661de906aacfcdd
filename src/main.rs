use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use farm_manager::config::ManagerConfig;
use farm_manager::error::StoreError;
use farm_manager::eventbus::{
    AmqpPublisher, BrokerForwarder, EventBus, LifeCycleEvent, LifeCycleType, TracingListener,
};
use farm_manager::farmstatus::FarmStatusService;
use farm_manager::store::integrity::IntegrityErrorHandler;
use farm_manager::store::{IntegrityMonitor, Store, run_wal_checkpoint_loop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ManagerConfig::from_env();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Farm manager starting");

    // ── Database ─────────────────────────────────────────────────────────
    // Any open fault (including a failed integrity check) ends the process
    // before anything is served.
    let store = Arc::new(
        Store::open(&config.database_path, config.store.clone())
            .await
            .with_context(|| format!("opening database {}", config.database_path.display()))?,
    );

    let shutdown = CancellationToken::new();

    // Background check failures are reported, not fatal.
    let on_integrity_error: IntegrityErrorHandler = Arc::new(|e: &StoreError| {
        tracing::error!(error = %e, "Background integrity check failed, continuing");
    });
    let integrity = IntegrityMonitor::spawn(
        store.clone(),
        config.store.integrity_check_period,
        shutdown.child_token(),
        on_integrity_error,
    );
    let wal = tokio::spawn(run_wal_checkpoint_loop(store.clone(), shutdown.child_token()));

    // ── Event bus ────────────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    bus.add_listener(Arc::new(TracingListener));

    // Without a reachable broker the manager keeps running, it just does not
    // forward events.
    let mut broker = None;
    if let Some(url) = &config.broker_url {
        match AmqpPublisher::connect(url, config.broker_exchange.clone()).await {
            Ok(publisher) => {
                let publisher = Arc::new(publisher);
                let (forwarder, runner) =
                    BrokerForwarder::new(config.topic_prefix.clone(), config.forwarder_queue_size);
                bus.add_forwarder(Arc::new(forwarder));
                let task = tokio::spawn(runner.run(publisher.clone(), shutdown.child_token()));
                broker = Some((publisher, task));
            }
            Err(e) => tracing::error!(error = %e, "Not forwarding events to the message broker"),
        }
    }

    let farm_status = Arc::new(FarmStatusService::new(
        store.clone(),
        bus.clone(),
        config.farm_status_poll,
    ));
    let farm_status_task = {
        let farm_status = farm_status.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move { farm_status.run(cancel).await })
    };

    bus.broadcast_lifecycle(LifeCycleEvent::new(LifeCycleType::ManagerStartup));
    tracing::info!(database = %config.database_path.display(), "Farm manager running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");

    bus.broadcast_lifecycle(LifeCycleEvent::new(LifeCycleType::ManagerShutdown));
    shutdown.cancel();

    tracing::info!(
        checks = integrity.checks_completed(),
        failed = integrity.checks_failed(),
        "Stopping integrity monitor"
    );
    integrity.join().await;
    if let Err(e) = wal.await {
        tracing::warn!(error = %e, "Write-ahead log checkpoint task ended abnormally");
    }
    if let Err(e) = farm_status_task.await {
        tracing::warn!(error = %e, "Farm status task ended abnormally");
    }
    if let Some((publisher, task)) = broker {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Broker forwarding task ended abnormally");
        }
        publisher.close().await;
    }

    tracing::info!("Farm manager stopped");
    Ok(())
}
