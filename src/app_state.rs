use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{ImageRepository, PgImageRepository, PgRequestRepository, RequestRepository};
use crate::services::{producer::Producer, queue::RedisQueue, storage::BlobStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<RedisQueue>,
    pub images: Arc<dyn ImageRepository>,
    pub requests: Arc<dyn RequestRepository>,
    pub storage: Arc<dyn BlobStore>,
    pub producer: Arc<Producer>,
    pub signed_url_ttl: Duration,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: Arc<dyn BlobStore>,
        queue: RedisQueue,
        signed_url_ttl: Duration,
    ) -> Self {
        let images: Arc<dyn ImageRepository> = Arc::new(PgImageRepository::new(db.clone()));
        let requests: Arc<dyn RequestRepository> = Arc::new(PgRequestRepository::new(db.clone()));
        let queue = Arc::new(queue);

        let producer = Producer::new(
            Arc::clone(&images),
            Arc::clone(&requests),
            Arc::clone(&storage),
            queue.clone(),
            tracing::info_span!("producer"),
        );

        Self {
            db,
            queue,
            images,
            requests,
            storage,
            producer: Arc::new(producer),
            signed_url_ttl,
        }
    }
}
