use garde::Validate;
use std::sync::Arc;
use tracing::Span;
use uuid::Uuid;

use crate::db::{ImageRepository, RequestRepository};
use crate::error::ServiceError;
use crate::models::request::{ConversionForm, NewConversionRequest, RequestStatus};
use crate::services::queue::{QueueMessage, QueueTransport};
use crate::services::storage::BlobStore;

/// Outcome of a submission. The request id is handed out even when the
/// work item could not be enqueued.
#[derive(Debug, Clone)]
pub struct Submission {
    pub request_id: Uuid,
    pub source_image_id: Uuid,
    pub status: RequestStatus,
    pub enqueued: bool,
}

/// Accepts conversion jobs: persists the source, records the request and
/// hands a work item to the queue.
pub struct Producer {
    images: Arc<dyn ImageRepository>,
    requests: Arc<dyn RequestRepository>,
    storage: Arc<dyn BlobStore>,
    queue: Arc<dyn QueueTransport>,
    span: Span,
}

impl Producer {
    pub fn new(
        images: Arc<dyn ImageRepository>,
        requests: Arc<dyn RequestRepository>,
        storage: Arc<dyn BlobStore>,
        queue: Arc<dyn QueueTransport>,
        span: Span,
    ) -> Self {
        Self {
            images,
            requests,
            storage,
            queue,
            span,
        }
    }

    /// Submit `source` for conversion on behalf of `user_id`.
    ///
    /// Side effects happen in a fixed order: image row, blob upload, request
    /// row, publish. The request row must exist before the message does, or the
    /// consumer could pick up a message for a row it cannot see yet.
    ///
    /// If the image row is written but the upload fails, the row stays behind
    /// without bytes. A failed publish is not an error for the caller: the
    /// request is moved to `failed` (best effort) and `enqueued` is false.
    pub async fn submit(
        &self,
        user_id: Uuid,
        form: &ConversionForm,
        source: &[u8],
    ) -> Result<Submission, ServiceError> {
        form.validate()
            .map_err(|report| ServiceError::InvalidInput(report.to_string()))?;
        if source.is_empty() {
            return Err(ServiceError::InvalidInput("source file is empty".to_string()));
        }

        let image = self.images.insert(&form.filename, form.source_format).await?;
        tracing::info!(parent: &self.span, image_id = %image.id, "Source image saved in the database");

        self.storage
            .upload(&image.storage_key, source, form.source_format.content_type())
            .await?;
        tracing::info!(
            parent: &self.span,
            image_id = %image.id,
            bytes = source.len(),
            "Source image uploaded to blob storage"
        );

        let request = self
            .requests
            .insert(NewConversionRequest {
                user_id,
                source_image_id: image.id,
                source_format: form.source_format,
                target_format: form.target_format,
                ratio: form.ratio,
            })
            .await?;
        tracing::info!(parent: &self.span, request_id = %request.id, "Conversion request queued");
        metrics::counter!("conversion_requests_submitted_total").increment(1);

        let message = QueueMessage {
            file_id: image.id,
            filename: form.filename.clone(),
            source_format: form.source_format,
            target_format: form.target_format,
            request_id: request.id,
            ratio: form.ratio,
        };

        match self.queue.publish(&message).await {
            Ok(()) => {
                tracing::info!(parent: &self.span, request_id = %request.id, "Message published to the queue");
                Ok(Submission {
                    request_id: request.id,
                    source_image_id: image.id,
                    status: RequestStatus::Queued,
                    enqueued: true,
                })
            }
            Err(e) => {
                metrics::counter!("conversion_enqueue_failures_total").increment(1);
                tracing::error!(
                    parent: &self.span,
                    request_id = %request.id,
                    error = %e,
                    "Failed to publish conversion message"
                );

                let status = match self
                    .requests
                    .update_status(request.id, RequestStatus::Failed, None)
                    .await
                {
                    Ok(()) => RequestStatus::Failed,
                    Err(update_err) => {
                        tracing::warn!(
                            parent: &self.span,
                            request_id = %request.id,
                            error = %update_err,
                            "Could not mark unpublished request as failed"
                        );
                        RequestStatus::Queued
                    }
                };

                Ok(Submission {
                    request_id: request.id,
                    source_image_id: image.id,
                    status,
                    enqueued: false,
                })
            }
        }
    }
}
