use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::Span;
use uuid::Uuid;

use crate::db::{ImageRepository, RepositoryError, RequestRepository};
use crate::error::ServiceError;
use crate::models::image::Image;
use crate::models::request::RequestStatus;
use crate::services::converter::{self, target_filename};
use crate::services::queue::{Delivery, QueueMessage, QueueTransport};
use crate::services::storage::BlobStore;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Unacknowledged deliveries this consumer may hold at once.
    pub concurrency: usize,
    /// Deliveries of one request before a failing message is dead-lettered.
    pub max_attempts: i32,
    /// Pause between receives while the queue is empty.
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_attempts: 5,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Result of a successful `process` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Converted { target_image_id: Uuid },
    /// Redelivery of a request that had already reached `done`.
    AlreadyDone { target_image_id: Option<Uuid> },
}

/// How a delivery was settled with the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    DeadLettered,
}

/// Drains the conversion queue and drives each request through
/// queued -> processing -> done, or to failed.
pub struct Consumer {
    transport: Arc<dyn QueueTransport>,
    images: Arc<dyn ImageRepository>,
    requests: Arc<dyn RequestRepository>,
    storage: Arc<dyn BlobStore>,
    config: ConsumerConfig,
    permits: Arc<Semaphore>,
    span: Span,
}

impl Consumer {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        images: Arc<dyn ImageRepository>,
        requests: Arc<dyn RequestRepository>,
        storage: Arc<dyn BlobStore>,
        config: ConsumerConfig,
        span: Span,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            transport,
            images,
            requests,
            storage,
            config,
            permits,
            span,
        }
    }

    /// Receive and process deliveries until `shutdown` flips to true (or its
    /// sender is dropped), then wait for in-flight deliveries to settle.
    ///
    /// A permit is taken before every receive and held until the delivery is
    /// acked or nacked, so at most `concurrency` deliveries are ever
    /// unacknowledged on this consumer.
    pub async fn listen(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), ServiceError> {
        let recovered = self.transport.recover().await?;
        if recovered > 0 {
            tracing::warn!(parent: &self.span, recovered, "Returned unacknowledged deliveries to the queue");
        }

        tracing::info!(
            parent: &self.span,
            concurrency = self.config.concurrency,
            max_attempts = self.config.max_attempts,
            "Queue is listening"
        );

        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.transport.receive().await {
                Ok(Some(delivery)) => {
                    let consumer = Arc::clone(&self);
                    tasks.spawn(async move {
                        consumer.handle(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(parent: &self.span, error = %e, "Failed to receive from the queue");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(parent: &self.span, error = %e, "Delivery task aborted");
                }
            }
        }

        tracing::info!(parent: &self.span, in_flight = tasks.len(), "Shutting down, draining in-flight deliveries");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(parent: &self.span, error = %e, "Delivery task aborted");
            }
        }

        Ok(())
    }

    /// Process one delivery and settle it.
    ///
    /// Success is acked. Any failure is followed by a best-effort write of
    /// `failed` to the request row and a nack: requeued while attempts remain,
    /// dead-lettered once `max_attempts` is reached or the error is permanent.
    pub async fn handle(&self, delivery: Delivery) -> Settlement {
        let request_id = delivery.message.request_id;

        // Duplicates of finished work are settled before they count as an attempt.
        match self.requests.get(request_id).await {
            Ok(Some(request)) if request.status.is_terminal() => {
                tracing::info!(parent: &self.span, %request_id, "Request already done, skipping redelivery");
                if let Err(e) = self.transport.ack(&delivery).await {
                    tracing::error!(parent: &self.span, %request_id, error = %e, "Can't acknowledge delivery");
                }
                return Settlement::Acked;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(parent: &self.span, %request_id, "Message references an unknown request");
                return self.settle_failure(&delivery, false).await;
            }
            Err(e) => {
                tracing::error!(parent: &self.span, %request_id, error = %e, "Could not load request");
                return self.settle_failure(&delivery, true).await;
            }
        }

        let attempt = match self.requests.record_attempt(request_id).await {
            Ok(attempt) => attempt,
            Err(RepositoryError::NoSuchRequest) => {
                tracing::warn!(parent: &self.span, %request_id, "Message references an unknown request");
                return self.settle_failure(&delivery, false).await;
            }
            Err(e) => {
                tracing::error!(parent: &self.span, %request_id, error = %e, "Could not record delivery attempt");
                return self.settle_failure(&delivery, true).await;
            }
        };

        let started = Instant::now();
        match self.process(&delivery.message).await {
            Ok(outcome) => {
                metrics::histogram!("conversion_processing_seconds").record(started.elapsed().as_secs_f64());
                match outcome {
                    Outcome::Converted { target_image_id } => {
                        metrics::counter!("conversion_jobs_completed_total").increment(1);
                        tracing::info!(
                            parent: &self.span,
                            %request_id,
                            %target_image_id,
                            attempt,
                            duration_ms = started.elapsed().as_millis() as u64,
                            "Conversion completed"
                        );
                    }
                    Outcome::AlreadyDone { .. } => {
                        tracing::info!(parent: &self.span, %request_id, attempt, "Request already done, skipping redelivery");
                    }
                }

                if let Err(e) = self.transport.ack(&delivery).await {
                    tracing::error!(parent: &self.span, %request_id, error = %e, "Can't acknowledge delivery");
                }
                Settlement::Acked
            }
            Err(e) => {
                metrics::counter!("conversion_jobs_failed_total").increment(1);
                tracing::error!(
                    parent: &self.span,
                    %request_id,
                    attempt,
                    error = %e,
                    "Error processing a message from the queue"
                );

                if let Err(update_err) = self
                    .requests
                    .update_status(request_id, RequestStatus::Failed, None)
                    .await
                {
                    tracing::warn!(
                        parent: &self.span,
                        %request_id,
                        error = %update_err,
                        original_error = %e,
                        "Can't mark request as failed"
                    );
                }

                let requeue = !e.is_permanent() && attempt < self.config.max_attempts;
                self.settle_failure(&delivery, requeue).await
            }
        }
    }

    async fn settle_failure(&self, delivery: &Delivery, requeue: bool) -> Settlement {
        let request_id = delivery.message.request_id;
        if let Err(e) = self.transport.nack(delivery, requeue).await {
            tracing::error!(parent: &self.span, %request_id, error = %e, "Can't make negative acknowledgement");
        }

        if requeue {
            Settlement::Requeued
        } else {
            metrics::counter!("conversion_jobs_dead_lettered_total").increment(1);
            tracing::warn!(parent: &self.span, %request_id, "Message moved to the dead-letter queue");
            Settlement::DeadLettered
        }
    }

    /// Run the conversion for one message.
    ///
    /// Steps: download source, convert, mark `processing`, record the target
    /// image, upload it, mark `done`. Redelivery after a partial run reuses the
    /// target image row keyed by the request, and a request that is already
    /// `done` is left untouched.
    pub async fn process(&self, message: &QueueMessage) -> Result<Outcome, ServiceError> {
        let request_id = message.request_id;

        let request = self
            .requests
            .get(request_id)
            .await?
            .ok_or(RepositoryError::NoSuchRequest)?;
        if request.status.is_terminal() {
            return Ok(Outcome::AlreadyDone {
                target_image_id: request.target_image_id,
            });
        }

        let source = self
            .storage
            .download(&Image::storage_key_for(message.file_id))
            .await?;
        tracing::debug!(parent: &self.span, %request_id, bytes = source.len(), "Source downloaded");

        let target_format = message.target_format;
        let ratio = message.ratio;
        let converted = tokio::task::spawn_blocking(move || converter::convert(&source, target_format, ratio))
            .await
            .map_err(|e| ServiceError::Task(e.to_string()))?;
        let converted = converted?;

        if let Some(outcome) = self
            .advance(request_id, RequestStatus::Processing, None)
            .await?
        {
            return Ok(outcome);
        }

        let target = self
            .images
            .insert_target(
                request_id,
                &target_filename(&message.filename, target_format),
                target_format,
            )
            .await?;

        self.storage
            .upload(&target.storage_key, &converted, target_format.content_type())
            .await?;
        tracing::debug!(parent: &self.span, %request_id, target_image_id = %target.id, "Target uploaded");

        if let Some(outcome) = self
            .advance(request_id, RequestStatus::Done, Some(target.id))
            .await?
        {
            return Ok(outcome);
        }

        Ok(Outcome::Converted {
            target_image_id: target.id,
        })
    }

    /// Move the request to `status`. A concurrent delivery of the same message
    /// may have finished it already; that yields `AlreadyDone` instead of an
    /// invalid transition.
    async fn advance(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        target_image_id: Option<Uuid>,
    ) -> Result<Option<Outcome>, ServiceError> {
        match self
            .requests
            .update_status(request_id, status, target_image_id)
            .await
        {
            Ok(()) => Ok(None),
            Err(RepositoryError::InvalidTransition {
                from: RequestStatus::Done,
                ..
            }) => {
                tracing::info!(parent: &self.span, %request_id, "Request finished by a concurrent delivery");
                let target_image_id = self
                    .requests
                    .get(request_id)
                    .await?
                    .and_then(|request| request.target_image_id);
                Ok(Some(Outcome::AlreadyDone { target_image_id }))
            }
            Err(e) => Err(e.into()),
        }
    }
}
