use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::image::{Image, ImageFormat};
use crate::models::request::{ConversionRequest, NewConversionRequest, RequestStatus};

pub mod images;
pub mod requests;

pub use images::PgImageRepository;
pub use requests::PgRequestRepository;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Image metadata rows.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Insert a source image row. The storage key is derived from the new id.
    async fn insert(&self, name: &str, format: ImageFormat) -> Result<Image, RepositoryError>;

    /// Insert the converted image for a request, or return the one already
    /// recorded for it.
    async fn insert_target(
        &self,
        request_id: Uuid,
        name: &str,
        format: ImageFormat,
    ) -> Result<Image, RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<Image>, RepositoryError>;

    /// Image that is the source or target of one of `user_id`'s requests.
    async fn find_for_user(&self, user_id: Uuid, image_id: Uuid) -> Result<Image, RepositoryError>;
}

/// Conversion request rows.
#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn insert(&self, new: NewConversionRequest) -> Result<ConversionRequest, RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<ConversionRequest>, RepositoryError>;

    /// Request history for a user, newest first.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<ConversionRequest>, RepositoryError>;

    /// Move a request to `status`. Errors with `NoSuchRequest` when no row has
    /// the id and with `InvalidTransition` when the move would go backwards.
    async fn update_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        target_image_id: Option<Uuid>,
    ) -> Result<(), RepositoryError>;

    /// Count one more delivery of the request and return the new total.
    async fn record_attempt(&self, id: Uuid) -> Result<i32, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("request with the given id does not exist")]
    NoSuchRequest,

    #[error("image with the given id does not exist")]
    NoSuchImage,

    #[error("request cannot move from {from} to {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
