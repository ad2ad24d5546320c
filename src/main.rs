use axum::{routing::get, routing::post, Router};
use image_converter::{
    app_state::AppState,
    config::AppConfig,
    db,
    routes,
    services::{queue::RedisQueue, storage::S3Store},
    shutdown::shutdown_signal,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing image-converter API");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "conversion_requests_submitted_total",
        "Conversion requests recorded in the database"
    );
    metrics::describe_counter!(
        "conversion_enqueue_failures_total",
        "Conversion requests whose work item could not be published"
    );

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!(bucket = %config.s3_bucket, "Initializing S3 storage client");
    let storage = S3Store::new(
        &config.s3_bucket,
        &config.s3_region,
        config.s3_endpoint.as_deref(),
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize S3 client");

    tracing::info!(queue = %config.queue_name, "Connecting to Redis work queue");
    let queue = RedisQueue::new(&config.redis_url, &config.queue_name, &config.worker_id)
        .expect("Failed to initialize work queue");

    let state = AppState::new(
        db_pool,
        Arc::new(storage),
        queue,
        Duration::from_secs(u64::from(config.signed_url_ttl_secs)),
    );

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/conversions",
            post(routes::conversions::submit_conversion).get(routes::conversions::list_conversions),
        )
        .route(
            "/api/v1/conversions/{request_id}",
            get(routes::conversions::get_conversion),
        )
        .route("/api/v1/images/{image_id}/url", get(routes::images::image_url))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES));

    tracing::info!("Starting image-converter on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
