use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::{ImageRepository, RepositoryError};
use crate::models::image::{Image, ImageFormat};

pub struct PgImageRepository {
    pool: PgPool,
}

impl PgImageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn image_from_row(row: &PgRow) -> Result<Image, RepositoryError> {
    let format: String = row.try_get("format")?;
    Ok(Image {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        format: format
            .parse()
            .map_err(|_| RepositoryError::CorruptRow(format!("unknown image format '{format}'")))?,
        storage_key: row.try_get("storage_key")?,
    })
}

#[async_trait]
impl ImageRepository for PgImageRepository {
    async fn insert(&self, name: &str, format: ImageFormat) -> Result<Image, RepositoryError> {
        let id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO images (id, name, format, storage_key)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, format, storage_key
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(format.to_string())
        .bind(Image::storage_key_for(id))
        .fetch_one(&self.pool)
        .await?;

        image_from_row(&row)
    }

    async fn insert_target(
        &self,
        request_id: Uuid,
        name: &str,
        format: ImageFormat,
    ) -> Result<Image, RepositoryError> {
        let id = Uuid::new_v4();
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query(
            r#"
            INSERT INTO images (id, name, format, storage_key, produced_by_request_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (produced_by_request_id)
            DO UPDATE SET produced_by_request_id = EXCLUDED.produced_by_request_id
            RETURNING id, name, format, storage_key
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(format.to_string())
        .bind(Image::storage_key_for(id))
        .bind(request_id)
        .fetch_one(&self.pool)
        .await?;

        image_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Image>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, format, storage_key FROM images WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(image_from_row).transpose()
    }

    async fn find_for_user(&self, user_id: Uuid, image_id: Uuid) -> Result<Image, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT i.id, i.name, i.format, i.storage_key
            FROM images i
            WHERE i.id = $2
              AND EXISTS (
                SELECT 1 FROM conversion_requests r
                WHERE r.user_id = $1
                  AND (r.source_image_id = i.id OR r.target_image_id = i.id)
              )
            "#,
        )
        .bind(user_id)
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => image_from_row(&r),
            None => Err(RepositoryError::NoSuchImage),
        }
    }
}
