use image_converter::{
    config::AppConfig,
    db::{self, PgImageRepository, PgRequestRepository},
    services::{consumer::Consumer, queue::RedisQueue, storage::S3Store},
    shutdown::shutdown_signal,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting image conversion worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .expect("METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");

    metrics::describe_histogram!(
        "conversion_processing_seconds",
        "Time to process one conversion delivery"
    );
    metrics::describe_counter!("conversion_jobs_completed_total", "Conversions finished");
    metrics::describe_counter!("conversion_jobs_failed_total", "Conversion attempts that failed");
    metrics::describe_counter!(
        "conversion_jobs_dead_lettered_total",
        "Deliveries parked in the dead-letter queue"
    );

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let storage = S3Store::new(
        &config.s3_bucket,
        &config.s3_region,
        config.s3_endpoint.as_deref(),
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize S3 client");

    let queue = RedisQueue::new(&config.redis_url, &config.queue_name, &config.worker_id)
        .expect("Failed to initialize work queue");

    let consumer = Arc::new(Consumer::new(
        Arc::new(queue),
        Arc::new(PgImageRepository::new(db_pool.clone())),
        Arc::new(PgRequestRepository::new(db_pool)),
        Arc::new(storage),
        config.consumer_config(),
        tracing::info_span!("consumer", worker_id = %config.worker_id),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(worker_id = %config.worker_id, "Worker ready, listening to the queue");

    if let Err(e) = consumer.listen(shutdown_rx).await {
        tracing::error!(error = %e, "Worker stopped with an error");
        std::process::exit(1);
    }

    tracing::info!("Worker stopped");
}
