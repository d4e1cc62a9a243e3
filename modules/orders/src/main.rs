use event_bus::{EventBus, InMemoryBus, NatsBus};
use idempotency::{IdempotencyGate, InMemoryKeyStore, KeyCleanup, KeyStore, PgKeyStore};
use outbox::{InMemoryOutboxStore, OutboxRelay, OutboxStore, PgOutboxStore, RelayHandle};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orders_rs::{
    config::Config,
    events,
    health::OutboxStatsSource,
    metrics::ServiceMetrics,
    repos::{InMemoryOrderRepository, OrderRepository, PgOrderRepository},
    routes::{router, AppState},
};

struct Backend {
    orders: Arc<dyn OrderRepository>,
    stats: Arc<dyn OutboxStatsSource>,
    keys: Arc<dyn KeyStore>,
    relay: RelayHandle,
}

fn start_relay<S: OutboxStore>(
    store: Arc<S>,
    bus: Arc<dyn EventBus>,
    config: &Config,
    metrics: &ServiceMetrics,
) -> RelayHandle {
    OutboxRelay::new(store, bus, config.relay.clone())
        .with_metrics(metrics.outbox.clone())
        .start()
}

async fn backend(
    config: &Config,
    bus: Arc<dyn EventBus>,
    metrics: &ServiceMetrics,
) -> Result<Backend, Box<dyn std::error::Error>> {
    let registry = Arc::new(events::registry(config.max_retries));

    match (config.store_type.as_str(), config.database_url.as_deref()) {
        ("postgres", Some(url)) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;

            let outbox = Arc::new(PgOutboxStore::new(pool.clone()));
            let orders = PgOrderRepository::new(PgOutboxStore::new(pool.clone()), registry);
            orders.ensure_schema().await?;
            let keys = PgKeyStore::new(pool);
            keys.ensure_schema().await?;

            Ok(Backend {
                orders: Arc::new(orders),
                stats: outbox.clone(),
                keys: Arc::new(keys),
                relay: start_relay(outbox, bus, config, metrics),
            })
        }
        _ => {
            tracing::warn!("Using in-memory stores; state is lost on restart");
            let outbox = InMemoryOutboxStore::new();
            let orders = InMemoryOrderRepository::new(outbox.clone(), registry);
            let outbox = Arc::new(outbox);

            Ok(Backend {
                orders: Arc::new(orders),
                stats: outbox.clone(),
                keys: Arc::new(InMemoryKeyStore::new()),
                relay: start_relay(outbox, bus, config, metrics),
            })
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        store_type = %config.store_type,
        bus_type = %config.bus_type,
        "Configuration loaded"
    );

    let bus: Arc<dyn EventBus> = match config.bus_type.as_str() {
        "inmemory" => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
        "nats" => {
            tracing::info!(nats_url = %config.nats_url, "Connecting to NATS");
            let client = async_nats::connect(&config.nats_url).await?;
            if config.nats_jetstream {
                Arc::new(NatsBus::with_jetstream(client))
            } else {
                Arc::new(NatsBus::new(client))
            }
        }
        other => {
            return Err(format!("Invalid BUS_TYPE: {other}. Must be 'inmemory' or 'nats'").into())
        }
    };

    let metrics = ServiceMetrics::new()?;
    let backend = backend(&config, bus, &metrics).await?;

    let cleanup = KeyCleanup::new(backend.keys.clone(), config.key_cleanup_interval).start();
    let gate = IdempotencyGate::new(backend.keys, config.idempotency.clone())
        .with_metrics(metrics.idempotency.clone());

    let state = AppState {
        orders: backend.orders,
        outbox: backend.stats,
        metrics,
        outbox_max_lag: config.outbox_max_lag,
    };

    let app = router(state, gate)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Order service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Requests have drained; let the relay finish its batch
    let relay_stats = backend.relay.stop().await;
    tracing::info!(
        published = relay_stats.published,
        failed = relay_stats.failed,
        poisoned = relay_stats.poisoned,
        "Outbox relay stopped"
    );
    cleanup.stop().await;

    Ok(())
}
