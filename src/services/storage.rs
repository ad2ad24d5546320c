use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::time::Duration;

/// Content-addressed file storage for source and converted images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Time-limited URL a client can fetch the object from directly.
    async fn signed_download_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// Client for S3 or an S3-compatible object store.
pub struct S3Store {
    bucket: Box<Bucket>,
}

impl S3Store {
    pub fn new(
        bucket_name: &str,
        region: &str,
        endpoint: Option<&str>,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                region: region.to_string(),
                endpoint: endpoint.to_string(),
            },
            None => region
                .parse::<Region>()
                .map_err(|e| StorageError::Config(e.to_string()))?,
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        // S3-compatible stores (MinIO, R2) are addressed by path, not subdomain.
        let bucket = if endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self { bucket })
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        code => Err(StorageError::Status {
            key: key.to_string(),
            code,
        }),
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        check_status(key, response.status_code())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        check_status(key, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn signed_download_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let expiry = u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX);
        let url = self.bucket.presign_get(key, expiry, None).await?;
        Ok(url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("object '{0}' does not exist")]
    NotFound(String),

    #[error("S3 returned status {code} for '{key}'")]
    Status { key: String, code: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
