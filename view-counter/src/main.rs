use std::sync::Arc;

use axum::{routing::get, Router};
use common_batching::Accumulator;
use common_circuit_breaker::CircuitBreaker;
use common_kafka::SingleTopicConsumer;
use common_metrics::{serve, setup_metrics_routes, MetricsSink, PrometheusSink};
use futures::future::ready;
use health::HealthRegistry;
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use view_counter::{
    config::Config, consumer::ConsumerLoop, coordinator::FlushCoordinator, decode::ViewDecoder,
    store::PgCounterStore, types::ViewBatch,
};

fn setup_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env()))
        .init();
}

pub async fn index() -> &'static str {
    "view counter service"
}

fn start_health_liveness_server(
    config: &Config,
    liveness: HealthRegistry,
) -> anyhow::Result<JoinHandle<()>> {
    let liveness = Arc::new(liveness);
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router)?;
    let bind = format!("{}:{}", config.host, config.port);

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("health and metrics server failed: {}", e);
        }
    }))
}

async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_with_defaults()?;
    let metrics: Arc<dyn MetricsSink> = Arc::new(PrometheusSink);

    let consumer = Arc::new(SingleTopicConsumer::new(
        config.kafka.clone(),
        config.consumer.clone(),
    )?);
    info!("Subscribed to topic: {}", consumer.topic());

    // Connections are made on first use, a database outage at startup is
    // handled like any other failed write
    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect_lazy(&config.database_url)?;
    let store = Arc::new(PgCounterStore::new(
        pool,
        &config.counter_table,
        &config.counter_column,
        &config.counter_id_column,
        &config.counter_id_type,
    ));

    let breaker = Arc::new(CircuitBreaker::new(
        "view-counter-storage",
        (&config.storage_breaker).into(),
        metrics.clone(),
    ));
    let coordinator = Arc::new(FlushCoordinator::new(
        store,
        consumer.clone(),
        breaker,
        config.max_retained_entities,
        metrics.clone(),
    ));
    let accumulator = Arc::new(Accumulator::<ViewBatch>::new(
        "view-counter",
        config.accumulator(),
        coordinator,
        metrics.clone(),
    ));

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness.register("consumer".to_string(), time::Duration::seconds(30));
    let server = start_health_liveness_server(&config, liveness)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    let consumer_loop = ConsumerLoop::new(
        consumer,
        ViewDecoder::from_config(&config),
        accumulator.clone(),
        config.fetch_backoff_ms.0,
        consumer_liveness,
        metrics,
    );
    consumer_loop.run(shutdown).await;

    accumulator.stop().await;
    server.abort();
    info!("Shut down cleanly");
    Ok(())
}
