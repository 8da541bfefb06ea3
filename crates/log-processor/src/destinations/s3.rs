// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffered destination writing gzip objects to a bucket.
//!
//! Events are grouped by (hour, log type). A buffer is flushed when it
//! reaches `max_buffer_bytes`, when it gets older than `max_buffer_age`, when
//! the buffers together exceed `max_buffered_bytes` (largest buffer first),
//! and when the input closes. Flushed buffers are handed to a fixed pool of
//! upload workers over a bounded channel, so a slow object store slows the
//! producers down instead of growing memory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};
use uuid::Uuid;

use crate::destinations::buffer::{BufferSet, EventBuffer, PartitionKey};
use crate::destinations::{Destination, Notification, Notifier, ObjectUploader};
use crate::errors::DestinationError;
use crate::parsers::ParsedEvent;

pub const DEFAULT_MAX_BUFFER_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_BUFFERED_BYTES: u64 = 4 * DEFAULT_MAX_BUFFER_BYTES;
pub const DEFAULT_MAX_BUFFER_AGE: Duration = Duration::from_secs(60);
pub const DEFAULT_UPLOAD_WORKERS: usize = 4;

const CONTENT_ENCODING: &str = "gzip";

#[derive(Debug, Clone)]
pub struct S3DestinationConfig {
    pub bucket: String,
    /// Flush a buffer once it holds this many uncompressed bytes.
    pub max_buffer_bytes: u64,
    /// Ceiling on uncompressed bytes across all buffers.
    pub max_buffered_bytes: u64,
    pub max_buffer_age: Duration,
    pub upload_workers: usize,
}

impl S3DestinationConfig {
    #[must_use]
    pub fn new(bucket: &str) -> Self {
        S3DestinationConfig {
            bucket: bucket.to_string(),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            max_buffer_age: DEFAULT_MAX_BUFFER_AGE,
            upload_workers: DEFAULT_UPLOAD_WORKERS,
        }
    }
}

/// Table name of a log type, e.g. `AWS.CloudTrail` -> `aws_cloudtrail`.
#[must_use]
pub fn table_name(log_type: &str) -> String {
    log_type.to_lowercase().replace('.', "_")
}

/// Object key for a new object of partition `key`.
#[must_use]
pub fn object_key(key: &PartitionKey) -> String {
    format!(
        "logs/{}/{}/{}-{}.json.gz",
        table_name(&key.log_type),
        key.hour.format("year=%Y/month=%m/day=%d/hour=%H"),
        key.hour.format("%Y%m%dT%H%M%SZ"),
        Uuid::new_v4()
    )
}

#[derive(Clone)]
pub struct S3Destination {
    config: Arc<S3DestinationConfig>,
    uploader: Arc<dyn ObjectUploader>,
    notifier: Arc<dyn Notifier>,
}

impl S3Destination {
    #[must_use]
    pub fn new(
        config: S3DestinationConfig,
        uploader: Arc<dyn ObjectUploader>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        S3Destination {
            config: Arc::new(config),
            uploader,
            notifier,
        }
    }

    fn spawn_workers(
        &self,
        uploads: mpsc::Receiver<EventBuffer>,
        errors: &mpsc::UnboundedSender<DestinationError>,
    ) -> JoinSet<()> {
        let uploads = Arc::new(Mutex::new(uploads));
        let mut workers = JoinSet::new();
        for _ in 0..self.config.upload_workers.max(1) {
            let uploads = Arc::clone(&uploads);
            let worker = UploadWorker {
                destination: self.clone(),
                errors: errors.clone(),
            };
            workers.spawn(async move {
                loop {
                    // The lock is released as soon as a buffer is received.
                    let next = uploads.lock().await.recv().await;
                    let Some(buffer) = next else { break };
                    worker.upload(buffer).await;
                }
            });
        }
        workers
    }
}

#[async_trait]
impl Destination for S3Destination {
    async fn send_events(
        &self,
        mut events: mpsc::Receiver<ParsedEvent>,
        errors: mpsc::UnboundedSender<DestinationError>,
    ) {
        let (upload_tx, upload_rx) = mpsc::channel(self.config.upload_workers.max(1));
        let mut workers = self.spawn_workers(upload_rx, &errors);
        let mut writer = BufferWriter {
            config: &self.config,
            buffers: BufferSet::new(),
            uploads: upload_tx,
            errors: &errors,
        };

        let mut ticker = tokio::time::interval(self.config.max_buffer_age);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => writer.flush_expired().await,
                event = events.recv() => match event {
                    Some(event) => writer.add(event).await,
                    None => break,
                },
            }
        }

        writer.flush_all().await;
        drop(writer);
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("upload worker failed: {e}");
            }
        }
    }
}

/// State owned by the consuming task.
struct BufferWriter<'a> {
    config: &'a S3DestinationConfig,
    buffers: BufferSet,
    uploads: mpsc::Sender<EventBuffer>,
    errors: &'a mpsc::UnboundedSender<DestinationError>,
}

impl BufferWriter<'_> {
    async fn add(&mut self, event: ParsedEvent) {
        let line = match event.to_json_line() {
            Ok(line) => line,
            Err(source) => {
                report(
                    self.errors,
                    DestinationError::Serialize {
                        log_type: event.log_type.clone(),
                        source,
                    },
                );
                return;
            }
        };
        let key = PartitionKey::for_event(&event);
        let line_len = line.len() as u64;

        let current = self.buffers.bytes_of(&key);
        if current > 0 && current + line_len > self.config.max_buffer_bytes {
            self.flush_key(&key).await;
        }

        match self.buffers.append(&key, &event, &line, Instant::now()) {
            Ok(size) if size >= self.config.max_buffer_bytes => self.flush_key(&key).await,
            Ok(_) => {}
            Err(source) => {
                // A buffer with a broken gzip stream cannot be sealed.
                self.buffers.remove(&key);
                report(
                    self.errors,
                    DestinationError::Buffer {
                        log_type: key.log_type.clone(),
                        source,
                    },
                );
            }
        }

        while self.buffers.total_bytes() > self.config.max_buffered_bytes {
            let Some(largest) = self.buffers.remove_largest() else {
                break;
            };
            debug!(
                log_type = %largest.key().log_type,
                bytes = largest.bytes(),
                total_bytes = self.buffers.total_bytes(),
                "buffered bytes over ceiling, evicting largest buffer"
            );
            self.flush(largest).await;
        }
    }

    async fn flush_key(&mut self, key: &PartitionKey) {
        if let Some(buffer) = self.buffers.remove(key) {
            self.flush(buffer).await;
        }
    }

    async fn flush_expired(&mut self) {
        let expired = self
            .buffers
            .take_expired(self.config.max_buffer_age, Instant::now());
        for buffer in expired {
            self.flush(buffer).await;
        }
    }

    async fn flush_all(&mut self) {
        for buffer in self.buffers.drain() {
            self.flush(buffer).await;
        }
    }

    async fn flush(&mut self, buffer: EventBuffer) {
        if buffer.events() == 0 {
            return;
        }
        if self.uploads.send(buffer).await.is_err() {
            report(self.errors, DestinationError::WorkersGone);
        }
    }
}

struct UploadWorker {
    destination: S3Destination,
    errors: mpsc::UnboundedSender<DestinationError>,
}

impl UploadWorker {
    async fn upload(&self, buffer: EventBuffer) {
        let log_type = buffer.key().log_type.clone();
        let sealed = match buffer.seal() {
            Ok(sealed) => sealed,
            Err(source) => {
                report(&self.errors, DestinationError::Buffer { log_type, source });
                return;
            }
        };
        let bucket = &self.destination.config.bucket;
        let key = object_key(&sealed.key);

        if let Err(e) = self
            .destination
            .uploader
            .put_object(bucket, &key, sealed.body, CONTENT_ENCODING)
            .await
        {
            report(&self.errors, e.into());
            return;
        }
        metrics::counter!("log_processor.objects_written", "log_type" => log_type.clone())
            .increment(1);
        debug!(
            bucket = %bucket,
            key = %key,
            events = sealed.events,
            bytes = sealed.bytes,
            "wrote object"
        );

        let notification = Notification {
            bucket: bucket.clone(),
            key,
            events: sealed.events,
            bytes: sealed.bytes,
            log_type,
            source_id: sealed.source_id,
            source_label: sealed.source_label,
        };
        if let Err(e) = self.destination.notifier.notify(&notification).await {
            report(&self.errors, e.into());
        }
    }
}

fn report(errors: &mpsc::UnboundedSender<DestinationError>, error: DestinationError) {
    error!("{error}");
    if errors.send(error).is_err() {
        debug!("destination error receiver dropped");
    }
}
