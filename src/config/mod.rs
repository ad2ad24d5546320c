use serde::Deserialize;
use std::time::Duration;

use crate::services::consumer::ConsumerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus listener for the worker process
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the conversion queue
    pub redis_url: String,

    /// Name of the work queue shared by API and worker
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Identifies this worker's in-flight list. Two processes sharing an id
    /// would recover each other's deliveries, so the default is per process.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Maximum number of unacknowledged deliveries held by one worker
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Deliveries of a failing request before it is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// S3 bucket name
    pub s3_bucket: String,

    /// S3 region (e.g., "eu-central-1")
    pub s3_region: String,

    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub s3_endpoint: Option<String>,

    /// S3 access key ID
    pub s3_access_key: String,

    /// S3 secret access key
    pub s3_secret_key: String,

    /// Lifetime of presigned download URLs
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_queue_name() -> String {
    "image_conversion".to_string()
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("worker-{host}-{}", std::process::id())
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_max_attempts() -> i32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_signed_url_ttl_secs() -> u32 {
    600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            concurrency: self.worker_concurrency.max(1),
            max_attempts: self.max_attempts.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}
