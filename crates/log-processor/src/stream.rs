// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingestion loop of one invocation.
//!
//! ```text
//!  initial batch ──┐
//!                  ├─> decode ─> stream channel ─> process ─> destination
//!  queue polling ──┘
//! ```
//!
//! The trigger batch is always processed. The queue is then polled until
//! the processing deadline (a fraction of the invocation timeout) passes
//! or a receive comes back empty. Messages polled by the loop are deleted
//! only once every event has been written.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::destinations::Destination;
use crate::errors::{DecodeError, QueueError, StreamError, TriggerError};
use crate::processor::{process, ClassifierBuilder, DataStream, ProcessSummary};

pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(900);
pub const DEFAULT_PROCESSING_FRACTION: f64 = 0.8;
pub const MAX_RECEIVE_MESSAGES: i32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Long-polls for up to `max_messages` messages.
    async fn receive(
        &self,
        max_messages: i32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;
    async fn delete(&self, receipt_handles: &[String]) -> Result<(), QueueError>;
    /// Visible plus delayed messages.
    async fn depth(&self) -> Result<u64, QueueError>;
}

/// Turns a message body into the streams it refers to.
#[async_trait]
pub trait MessageDecoder: Send + Sync {
    async fn decode(&self, body: &str) -> Result<Vec<DataStream>, DecodeError>;
}

/// Payload the function is invoked with.
///
/// Either a queue batch (`Records`) or a scale-out `{"tick": true}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TriggerEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<TriggerRecord>,
    #[serde(default)]
    pub tick: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRecord {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

impl TriggerEvent {
    #[must_use]
    pub fn tick() -> Self {
        TriggerEvent {
            records: Vec::new(),
            tick: true,
        }
    }

    /// Reads a payload saved as JSON, e.g. by a local runner.
    pub async fn from_file(path: &Path) -> Result<Self, TriggerError> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|source| TriggerError::Read {
                path: path.display().to_string(),
                source,
            })?;
        serde_json::from_slice(&contents).map_err(|source| TriggerError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn into_messages(self) -> Vec<QueueMessage> {
        self.records
            .into_iter()
            .map(|r| QueueMessage {
                message_id: r.message_id,
                receipt_handle: r.receipt_handle,
                body: r.body,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub invocation_timeout: Duration,
    /// Share of the timeout during which new messages are admitted.
    pub processing_fraction: f64,
    pub max_receive_messages: i32,
    pub max_wait: Duration,
    pub min_wait: Duration,
    /// Opened streams waiting for the processor. Each holds an open object
    /// body, so this bounds how many reads are in flight.
    pub stream_channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            processing_fraction: DEFAULT_PROCESSING_FRACTION,
            max_receive_messages: MAX_RECEIVE_MESSAGES,
            max_wait: Duration::from_secs(20),
            min_wait: Duration::from_secs(1),
            stream_channel_capacity: 2,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn processing_budget(&self) -> Duration {
        self.invocation_timeout.mul_f64(self.processing_fraction)
    }

    /// Receive wait time after `batches` non-empty receives: one second
    /// less per batch, never below `min_wait`.
    #[must_use]
    pub fn wait_time(&self, batches: u32) -> Duration {
        self.max_wait
            .saturating_sub(Duration::from_secs(u64::from(batches)))
            .max(self.min_wait)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Messages from the trigger batch.
    pub initial_messages: usize,
    pub polled_messages: usize,
    pub receive_batches: u32,
    pub deleted_messages: usize,
    pub process: ProcessSummary,
}

#[derive(Debug, Default)]
struct ReadSummary {
    initial_messages: usize,
    polled_receipts: Vec<String>,
    receive_batches: u32,
}

/// Runs one invocation: reads, processes and acknowledges messages.
pub async fn stream_events(
    config: &StreamConfig,
    trigger: TriggerEvent,
    queue: Arc<dyn QueueClient>,
    decoder: Arc<dyn MessageDecoder>,
    destination: Arc<dyn Destination>,
    builder: Arc<dyn ClassifierBuilder>,
) -> Result<StreamSummary, StreamError> {
    let deadline = Instant::now() + config.processing_budget();
    let (stream_tx, stream_rx) = mpsc::channel(config.stream_channel_capacity.max(1));

    let reader = tokio::spawn(read_messages(
        config.clone(),
        trigger.into_messages(),
        Arc::clone(&queue),
        decoder,
        stream_tx,
        deadline,
    ));
    let processed = process(stream_rx, destination, builder).await;
    let read = match reader.await {
        Ok(read) => read,
        Err(e) => Err(StreamError::ReaderTask(e.to_string())),
    };

    // Reading errors point at an upstream contract violation and win.
    let read = read?;
    let processed = processed?;

    let mut summary = StreamSummary {
        initial_messages: read.initial_messages,
        polled_messages: read.polled_receipts.len(),
        receive_batches: read.receive_batches,
        deleted_messages: 0,
        process: processed,
    };
    if !read.polled_receipts.is_empty() {
        match queue.delete(&read.polled_receipts).await {
            Ok(()) => summary.deleted_messages = read.polled_receipts.len(),
            Err(e) => error!(
                count = read.polled_receipts.len(),
                "failed to delete processed messages: {e}"
            ),
        }
    }
    info!(
        initial_messages = summary.initial_messages,
        polled_messages = summary.polled_messages,
        receive_batches = summary.receive_batches,
        deleted_messages = summary.deleted_messages,
        streams = summary.process.streams,
        events = summary.process.stats.event_count,
        "ingestion finished"
    );
    Ok(summary)
}

async fn read_messages(
    config: StreamConfig,
    initial: Vec<QueueMessage>,
    queue: Arc<dyn QueueClient>,
    decoder: Arc<dyn MessageDecoder>,
    streams: mpsc::Sender<DataStream>,
    deadline: Instant,
) -> Result<ReadSummary, StreamError> {
    let mut summary = ReadSummary {
        initial_messages: initial.len(),
        ..Default::default()
    };
    for message in &initial {
        if !forward(decoder.as_ref(), message, &streams).await? {
            return Ok(summary);
        }
    }

    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = config.wait_time(summary.receive_batches).min(remaining);
        let messages = queue.receive(config.max_receive_messages, wait).await?;
        if messages.is_empty() {
            debug!("queue drained");
            break;
        }
        summary.receive_batches += 1;
        for message in messages {
            if !forward(decoder.as_ref(), &message, &streams).await? {
                return Ok(summary);
            }
            summary.polled_receipts.push(message.receipt_handle);
        }
    }
    Ok(summary)
}

/// Decodes a message and queues its streams. Returns `false` once the
/// processing side has stopped.
async fn forward(
    decoder: &dyn MessageDecoder,
    message: &QueueMessage,
    streams: &mpsc::Sender<DataStream>,
) -> Result<bool, StreamError> {
    let decoded = decoder.decode(&message.body).await.map_err(|e| {
        error!(message_id = %message.message_id, "failed to decode message: {e}");
        e
    })?;
    for stream in decoded {
        if streams.send(stream).await.is_err() {
            warn!(message_id = %message.message_id, "processing stopped, not reading further");
            return Ok(false);
        }
    }
    Ok(true)
}
