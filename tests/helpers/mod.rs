//! In-memory collaborators for driving the producer and consumer without
//! PostgreSQL, Redis or S3.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, ImageFormat as Codec, Rgb, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use image_converter::db::{ImageRepository, RepositoryError, RequestRepository};
use image_converter::models::image::{Image, ImageFormat};
use image_converter::models::request::{
    ConversionForm, ConversionRequest, NewConversionRequest, RequestStatus,
};
use image_converter::services::consumer::{Consumer, ConsumerConfig};
use image_converter::services::producer::Producer;
use image_converter::services::queue::{Delivery, Envelope, QueueError, QueueMessage, QueueTransport};
use image_converter::services::storage::{BlobStore, StorageError};

// ---------------------------------------------------------------------------
// Relational store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    images: HashMap<Uuid, Image>,
    targets_by_request: HashMap<Uuid, Uuid>,
    requests: HashMap<Uuid, ConversionRequest>,
    /// Every status a request has held, in order.
    history: HashMap<Uuid, Vec<RequestStatus>>,
}

/// Implements both repositories over one set of tables.
#[derive(Default)]
pub struct InMemoryDb {
    tables: Mutex<Tables>,
    pub fail_image_inserts: AtomicBool,
    pub fail_status_updates: AtomicBool,
}

fn db_down() -> RepositoryError {
    RepositoryError::Database(sqlx::Error::PoolTimedOut)
}

impl InMemoryDb {
    pub fn image_count(&self) -> usize {
        self.tables.lock().unwrap().images.len()
    }

    pub fn request_count(&self) -> usize {
        self.tables.lock().unwrap().requests.len()
    }

    pub fn request(&self, id: Uuid) -> ConversionRequest {
        self.tables.lock().unwrap().requests[&id].clone()
    }

    pub fn all_requests(&self) -> Vec<ConversionRequest> {
        self.tables.lock().unwrap().requests.values().cloned().collect()
    }

    pub fn image(&self, id: Uuid) -> Option<Image> {
        self.tables.lock().unwrap().images.get(&id).cloned()
    }

    pub fn history(&self, id: Uuid) -> Vec<RequestStatus> {
        self.tables
            .lock()
            .unwrap()
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ImageRepository for InMemoryDb {
    async fn insert(&self, name: &str, format: ImageFormat) -> Result<Image, RepositoryError> {
        if self.fail_image_inserts.load(Ordering::SeqCst) {
            return Err(db_down());
        }
        let id = Uuid::new_v4();
        let image = Image {
            id,
            name: name.to_string(),
            format,
            storage_key: Image::storage_key_for(id),
        };
        self.tables.lock().unwrap().images.insert(id, image.clone());
        Ok(image)
    }

    async fn insert_target(
        &self,
        request_id: Uuid,
        name: &str,
        format: ImageFormat,
    ) -> Result<Image, RepositoryError> {
        if self.fail_image_inserts.load(Ordering::SeqCst) {
            return Err(db_down());
        }
        let mut tables = self.tables.lock().unwrap();
        if let Some(existing) = tables.targets_by_request.get(&request_id) {
            return Ok(tables.images[existing].clone());
        }
        let id = Uuid::new_v4();
        let image = Image {
            id,
            name: name.to_string(),
            format,
            storage_key: Image::storage_key_for(id),
        };
        tables.images.insert(id, image.clone());
        tables.targets_by_request.insert(request_id, id);
        Ok(image)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Image>, RepositoryError> {
        Ok(self.image(id))
    }

    async fn find_for_user(&self, user_id: Uuid, image_id: Uuid) -> Result<Image, RepositoryError> {
        let tables = self.tables.lock().unwrap();
        let owned = tables.requests.values().any(|r| {
            r.user_id == user_id
                && (r.source_image_id == image_id || r.target_image_id == Some(image_id))
        });
        match tables.images.get(&image_id) {
            Some(image) if owned => Ok(image.clone()),
            _ => Err(RepositoryError::NoSuchImage),
        }
    }
}

#[async_trait]
impl RequestRepository for InMemoryDb {
    async fn insert(&self, new: NewConversionRequest) -> Result<ConversionRequest, RepositoryError> {
        let now = Utc::now();
        let request = ConversionRequest {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            source_image_id: new.source_image_id,
            target_image_id: None,
            source_format: new.source_format,
            target_format: new.target_format,
            ratio: new.ratio,
            status: RequestStatus::Queued,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        let mut tables = self.tables.lock().unwrap();
        tables.requests.insert(request.id, request.clone());
        tables.history.insert(request.id, vec![RequestStatus::Queued]);
        Ok(request)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConversionRequest>, RepositoryError> {
        Ok(self.tables.lock().unwrap().requests.get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<ConversionRequest>, RepositoryError> {
        let mut requests: Vec<_> = self
            .tables
            .lock()
            .unwrap()
            .requests
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        target_image_id: Option<Uuid>,
    ) -> Result<(), RepositoryError> {
        if self.fail_status_updates.load(Ordering::SeqCst) {
            return Err(db_down());
        }
        let mut tables = self.tables.lock().unwrap();
        let request = tables
            .requests
            .get_mut(&id)
            .ok_or(RepositoryError::NoSuchRequest)?;
        if !request.status.can_transition_to(status) {
            return Err(RepositoryError::InvalidTransition {
                from: request.status,
                to: status,
            });
        }
        request.status = status;
        request.target_image_id = target_image_id.or(request.target_image_id);
        request.updated_at = Utc::now();
        tables.history.entry(id).or_default().push(status);
        Ok(())
    }

    async fn record_attempt(&self, id: Uuid) -> Result<i32, RepositoryError> {
        let mut tables = self.tables.lock().unwrap();
        let request = tables
            .requests
            .get_mut(&id)
            .ok_or(RepositoryError::NoSuchRequest)?;
        request.attempts += 1;
        Ok(request.attempts)
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_downloads: AtomicBool,
    pub fail_uploads: AtomicBool,
    pub download_delay: Mutex<Option<Duration>>,
}

impl InMemoryBlobStore {
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn put(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }
}

fn storage_down(key: &str) -> StorageError {
    StorageError::Status {
        key: key.to_string(),
        code: 503,
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(storage_down(key));
        }
        self.put(key, data.to_vec());
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let delay = *self.download_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(storage_down(key));
        }
        self.object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn signed_download_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        Ok(format!("memory://{key}?expires_in={}", ttl.as_secs()))
    }
}

// ---------------------------------------------------------------------------
// Queue transport
// ---------------------------------------------------------------------------

/// Queue that tracks unacknowledged deliveries so tests can check the
/// in-flight bound.
#[derive(Default)]
pub struct InMemoryQueue {
    ready: Mutex<VecDeque<String>>,
    in_flight: Mutex<HashMap<Uuid, String>>,
    dead: Mutex<Vec<String>>,
    max_in_flight: AtomicUsize,
    pub received: AtomicUsize,
    pub acked: AtomicUsize,
    pub fail_publish: AtomicBool,
}

impl InMemoryQueue {
    pub fn ready_len(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    pub fn dead_len(&self) -> usize {
        self.dead.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Decoded messages waiting to be received.
    pub fn ready_messages(&self) -> Vec<QueueMessage> {
        self.ready
            .lock()
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str::<Envelope>(raw).unwrap().body)
            .collect()
    }

    pub fn ready_envelopes(&self) -> Vec<Envelope> {
        self.ready
            .lock()
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(QueueError::Config("broker unreachable".to_string()));
        }
        let raw = serde_json::to_string(&Envelope::persistent(message.clone()))?;
        self.ready.lock().unwrap().push_back(raw);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let Some(raw) = self.ready.lock().unwrap().pop_front() else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_str(&raw)?;
        let in_flight = {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.insert(envelope.delivery_id, raw.clone());
            in_flight.len()
        };
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        self.received.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Delivery::new(envelope.body, envelope.delivery_id, raw)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.in_flight.lock().unwrap().remove(&delivery.delivery_id);
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let raw = self.in_flight.lock().unwrap().remove(&delivery.delivery_id);
        if let Some(raw) = raw {
            if requeue {
                self.ready.lock().unwrap().push_front(raw);
            } else {
                self.dead.lock().unwrap().push(raw);
            }
        }
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let drained: Vec<String> = self.in_flight.lock().unwrap().drain().map(|(_, raw)| raw).collect();
        let count = drained.len();
        self.ready.lock().unwrap().extend(drained);
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Pipeline {
    pub db: Arc<InMemoryDb>,
    pub storage: Arc<InMemoryBlobStore>,
    pub queue: Arc<InMemoryQueue>,
    pub producer: Producer,
    pub consumer: Arc<Consumer>,
}

impl Pipeline {
    pub fn new(config: ConsumerConfig) -> Self {
        let db = Arc::new(InMemoryDb::default());
        let storage = Arc::new(InMemoryBlobStore::default());
        let queue = Arc::new(InMemoryQueue::default());

        let producer = Producer::new(
            db.clone(),
            db.clone(),
            storage.clone(),
            queue.clone(),
            tracing::info_span!("producer"),
        );
        let consumer = Arc::new(Consumer::new(
            queue.clone(),
            db.clone(),
            db.clone(),
            storage.clone(),
            config,
            tracing::info_span!("consumer"),
        ));

        Self {
            db,
            storage,
            queue,
            producer,
            consumer,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(test_consumer_config(1, 5))
    }

    /// Receive one delivery and run it through the consumer.
    pub async fn deliver_next(&self) -> image_converter::services::consumer::Settlement {
        let delivery = self
            .queue
            .receive()
            .await
            .unwrap()
            .expect("queue should hold a message");
        self.consumer.handle(delivery).await
    }
}

pub fn test_consumer_config(concurrency: usize, max_attempts: i32) -> ConsumerConfig {
    ConsumerConfig {
        concurrency,
        max_attempts,
        poll_interval: Duration::from_millis(5),
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn sample_jpeg() -> Vec<u8> {
    let img = RgbImage::from_fn(32, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, 90]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, Codec::Jpeg)
        .unwrap();
    buf.into_inner()
}

pub fn photo_form(target: ImageFormat, ratio: i32) -> ConversionForm {
    ConversionForm {
        filename: "photo.jpg".to_string(),
        source_format: ImageFormat::Jpeg,
        target_format: target,
        ratio,
    }
}

/// Wait until every request row satisfies `done`, or panic after `timeout`.
pub async fn wait_until(db: &InMemoryDb, timeout: Duration, done: impl Fn(&ConversionRequest) -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if db.all_requests().iter().all(&done) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "requests did not settle within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
