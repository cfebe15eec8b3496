use std::sync::Arc;
use std::time::Duration;

use actix::prelude::*;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dc_replication::actors::{
    AggregateRegistry, HealthMonitorActor, ReplicationLink, ReplicationSupervisor, Shutdown,
};
use dc_replication::config::ReplicationConfig;
use dc_replication::domain::order::{order_handlers, FlatRateShipping, OrderAggregate, OrderReplicationPolicy};
use dc_replication::event_sourcing::{Aggregate, EventLog, OffsetStore, ScyllaEventLog, ScyllaOffsetStore};
use dc_replication::metrics::{start_metrics_server, Metrics};
use dc_replication::replication::{replication_tag, CoordinatorSettings};
use dc_replication::transport::{serve, GrpcConnector, ReplicationClient, ReplicationService};
use dc_replication::utils::{retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, RetryConfig};

#[actix::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, overridable with RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dc_replication=debug")),
        )
        .init();

    let config = ReplicationConfig::from_env()?;
    tracing::info!(
        region = %config.local_region,
        peers = ?config.peers.keys().collect::<Vec<_>>(),
        "🚀 Starting datacenter replication node"
    );

    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // === 1. ScyllaDB session, keyspace and tables ===
    let session = Arc::new(connect_scylla(&config, &metrics).await?);
    let log = Arc::new(ScyllaEventLog::new(session.clone(), &config.keyspace));
    log.ensure_schema().await?;
    let offsets = Arc::new(ScyllaOffsetStore::new(session.clone()));
    offsets.ensure_schema().await?;
    let log: Arc<dyn EventLog> = log;
    let offsets: Arc<dyn OffsetStore> = offsets;

    // === 2. Aggregates ===
    let settings = CoordinatorSettings {
        log: log.clone(),
        handlers: Arc::new(order_handlers(Arc::new(FlatRateShipping::default()))),
        policy: Arc::new(OrderReplicationPolicy::new(config.peers.keys().cloned())),
        local_region: config.local_region.clone(),
        max_pending_envelopes: config.max_pending_envelopes,
        metrics: metrics.clone(),
    };
    let orders: AggregateRegistry<OrderAggregate> =
        AggregateRegistry::new(settings, config.idle_timeout, config.request_timeout);

    // === 3. Outbound links, one per peer region ===
    let mut breakers = Vec::new();
    let mut links = Vec::new();
    for (region, endpoint) in &config.peers {
        let breaker = CircuitBreaker::new(region.clone(), CircuitBreakerConfig::default())
            .with_metrics(metrics.clone());
        breakers.push(breaker.clone());

        let client = ReplicationClient::new(
            region.clone(),
            log.clone(),
            Arc::new(GrpcConnector::new(endpoint.clone(), breaker)),
            config.max_in_flight,
            config.ack_timeout,
            metrics.clone(),
        );
        let tag = replication_tag(OrderAggregate::AGGREGATE_TYPE, region);
        links.push(ReplicationLink::new(tag, client, offsets.clone(), metrics.clone()));
    }

    let health = HealthMonitorActor::new(breakers, metrics.clone()).spawn_monitor();
    let links = links.into_iter().map(|link| link.with_health(health.clone())).collect();
    let supervisor = ReplicationSupervisor::new(links)
        .with_health(health.clone(), Duration::from_secs(30))
        .start();

    // === 4. Inbound gRPC server ===
    let service = ReplicationService::new(Arc::new(orders.clone()), config.max_in_flight, metrics.clone());
    let listen_addr = config.listen_addr;
    tokio::spawn(async move {
        if let Err(e) = serve(listen_addr, service).await {
            tracing::error!(error = %e, "gRPC server error");
        }
    });

    // === 5. Metrics / health endpoint ===
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    let monitor = health.clone();
    actix::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_registry, monitor, metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    tracing::info!("✅ Node ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("🛑 Shutting down");
    supervisor.send(Shutdown).await?;
    tracing::info!(live_aggregates = orders.live_instances(), "👋 Stopped");
    Ok(())
}

async fn connect_scylla(config: &ReplicationConfig, metrics: &Metrics) -> anyhow::Result<Session> {
    tracing::info!(uri = %config.scylla_uri, "Connecting to ScyllaDB...");
    let session = retry_with_backoff("scylla_connect", RetryConfig::startup(), Some(metrics), |_| {
        let builder = SessionBuilder::new().known_node(&config.scylla_uri);
        async move { builder.build().await }
    })
    .await
    .into_result()?;

    session
        .query_unpaged(
            format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                 {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                config.keyspace
            ),
            &[],
        )
        .await?;
    session.use_keyspace(&config.keyspace, false).await?;
    Ok(session)
}
