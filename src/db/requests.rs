use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::{RepositoryError, RequestRepository};
use crate::models::image::ImageFormat;
use crate::models::request::{ConversionRequest, NewConversionRequest, RequestStatus};

const REQUEST_COLUMNS: &str = "id, user_id, source_image_id, target_image_id, source_format, \
     target_format, ratio, status, attempts, created_at, updated_at";

pub struct PgRequestRepository {
    pool: PgPool,
}

impl PgRequestRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_format(raw: String) -> Result<ImageFormat, RepositoryError> {
    raw.parse()
        .map_err(|_| RepositoryError::CorruptRow(format!("unknown image format '{raw}'")))
}

fn parse_status(raw: String) -> Result<RequestStatus, RepositoryError> {
    raw.parse()
        .map_err(|_| RepositoryError::CorruptRow(format!("unknown request status '{raw}'")))
}

fn request_from_row(row: &PgRow) -> Result<ConversionRequest, RepositoryError> {
    Ok(ConversionRequest {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        source_image_id: row.try_get("source_image_id")?,
        target_image_id: row.try_get("target_image_id")?,
        source_format: parse_format(row.try_get("source_format")?)?,
        target_format: parse_format(row.try_get("target_format")?)?,
        ratio: row.try_get("ratio")?,
        status: parse_status(row.try_get("status")?)?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RequestRepository for PgRequestRepository {
    async fn insert(&self, new: NewConversionRequest) -> Result<ConversionRequest, RepositoryError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO conversion_requests
                (id, user_id, source_image_id, target_image_id, source_format, target_format, ratio, status)
            VALUES ($1, $2, $3, NULL, $4, $5, $6, 'queued')
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.source_image_id)
        .bind(new.source_format.to_string())
        .bind(new.target_format.to_string())
        .bind(new.ratio)
        .fetch_one(&self.pool)
        .await?;

        request_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConversionRequest>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM conversion_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(request_from_row).transpose()
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<ConversionRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM conversion_requests WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(request_from_row).collect()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        target_image_id: Option<Uuid>,
    ) -> Result<(), RepositoryError> {
        let allowed_from: Vec<String> = RequestStatus::allowed_predecessors(status)
            .iter()
            .map(ToString::to_string)
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE conversion_requests
            SET status = $2,
                target_image_id = COALESCE($3, target_image_id),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(target_image_id)
        .bind(allowed_from)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Zero rows: either the id is unknown or the row is in a state we may not leave.
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM conversion_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Err(RepositoryError::NoSuchRequest),
            Some(raw) => Err(RepositoryError::InvalidTransition {
                from: parse_status(raw)?,
                to: status,
            }),
        }
    }

    async fn record_attempt(&self, id: Uuid) -> Result<i32, RepositoryError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE conversion_requests
            SET attempts = attempts + 1
            WHERE id = $1
            RETURNING attempts
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        attempts.ok_or(RepositoryError::NoSuchRequest)
    }
}
