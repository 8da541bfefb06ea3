// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drives data streams through classifiers into a destination.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::classification::sources::{SourceClassifier, SourceLoader};
use crate::classification::{
    parser_stats_since, Classifier, ClassifierStats, LineClassifier,
};
use crate::destinations::Destination;
use crate::errors::{ClassifyError, DestinationError, ProcessError};
use crate::metrics;
use crate::parsers::{ParsedEvent, Registry};

/// Capacity of the channel between processors and the destination.
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Where a stream came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHints {
    pub s3_bucket: Option<String>,
    pub s3_key: Option<String>,
    pub content_type: Option<String>,
}

/// What is known about a stream before reading it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub hints: StreamHints,
    /// Log type known ahead of classification.
    pub log_type: Option<String>,
    pub source_id: Option<String>,
    /// Lines are source envelopes rather than raw logs.
    pub multiplexed: bool,
}

impl StreamInfo {
    /// Human readable origin used in logs.
    #[must_use]
    pub fn location(&self) -> String {
        match (&self.hints.s3_bucket, &self.hints.s3_key) {
            (Some(bucket), Some(key)) => format!("s3://{bucket}/{key}"),
            _ => match &self.source_id {
                Some(source_id) => format!("source:{source_id}"),
                None => "stream".to_string(),
            },
        }
    }
}

/// One input unit, read to the end by a single processor.
pub struct DataStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub info: StreamInfo,
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl DataStream {
    #[must_use]
    pub fn new(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        DataStream {
            reader,
            info: StreamInfo::default(),
        }
    }

    #[must_use]
    pub fn with_info(mut self, info: StreamInfo) -> Self {
        self.info = info;
        self
    }
}

/// Picks the classifier for a stream.
#[async_trait]
pub trait ClassifierBuilder: Send + Sync {
    async fn build(&self, stream: &StreamInfo) -> Result<Box<dyn LineClassifier>, ClassifyError>;
}

pub struct RegistryClassifierBuilder {
    registry: Arc<Registry>,
    sources: Arc<dyn SourceLoader>,
}

impl RegistryClassifierBuilder {
    #[must_use]
    pub fn new(registry: Arc<Registry>, sources: Arc<dyn SourceLoader>) -> Self {
        RegistryClassifierBuilder { registry, sources }
    }
}

#[async_trait]
impl ClassifierBuilder for RegistryClassifierBuilder {
    async fn build(&self, stream: &StreamInfo) -> Result<Box<dyn LineClassifier>, ClassifyError> {
        if stream.multiplexed {
            return Ok(Box::new(SourceClassifier::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.sources),
            )));
        }
        if let Some(log_type) = &stream.log_type {
            let parsers = self.registry.parsers_for(&[log_type])?;
            return Ok(Box::new(Classifier::new(parsers)));
        }
        if let Some(source_id) = &stream.source_id {
            let source = self.sources.load_source(source_id).await?;
            let parsers = self.registry.parsers_for(&source.log_types)?;
            return Ok(Box::new(
                Classifier::new(parsers).with_source(&source.id, &source.label),
            ));
        }
        Ok(Box::new(Classifier::new(self.registry.all_parsers()?)))
    }
}

/// Totals of one `process` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub streams: usize,
    pub stats: ClassifierStats,
}

/// Reads one stream through one classifier.
///
/// The classifier is borrowed so that a multiplexed classifier, and the
/// per-source cache behind it, outlives any single stream.
pub struct Processor<'a> {
    reader: Option<Box<dyn AsyncRead + Send + Unpin>>,
    source_id: Option<String>,
    location: String,
    classifier: &'a mut dyn LineClassifier,
}

impl<'a> Processor<'a> {
    #[must_use]
    pub fn new(stream: DataStream, classifier: &'a mut dyn LineClassifier) -> Self {
        Processor {
            location: stream.info.location(),
            source_id: stream.info.source_id,
            reader: Some(stream.reader),
            classifier,
        }
    }

    /// Reads the stream to the end, sending every event to `events`.
    /// Returns what this stream added to the classifier's counters.
    /// Metrics are emitted whatever the outcome.
    pub async fn run(
        mut self,
        events: &mpsc::Sender<ParsedEvent>,
    ) -> Result<ClassifierStats, ProcessError> {
        let stats_before = self.classifier.stats();
        let parsers_before = self.classifier.parser_stats();
        let result = self.read_lines(events).await;
        let stats = self.classifier.stats().since(&stats_before);
        metrics::record_stream(
            &self.location,
            &stats,
            &parser_stats_since(&self.classifier.parser_stats(), &parsers_before),
            result.is_ok(),
        );
        result.map(|()| stats)
    }

    async fn read_lines(&mut self, events: &mpsc::Sender<ParsedEvent>) -> Result<(), ProcessError> {
        let Some(reader) = self.reader.take() else {
            return Ok(());
        };
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut line_number: u64 = 0;

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|source| ProcessError::Read {
                    location: self.location.clone(),
                    line_number: line_number + 1,
                    source,
                })?;
            if read == 0 {
                return Ok(());
            }
            line_number += 1;

            let line = String::from_utf8_lossy(strip_newline(&buf));
            let result = match self.classifier.classify(&line).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        source_id = self.source_id.as_deref().unwrap_or_default(),
                        location = %self.location,
                        line_number,
                        "skipping line: {e}"
                    );
                    continue;
                }
            };
            for event in result.events {
                if events.send(event).await.is_err() {
                    return Err(ProcessError::DestinationClosed);
                }
            }
        }
    }
}

fn strip_newline(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

/// Processes every stream received on `streams`, one at a time, writing
/// events through `destination`.
///
/// Multiplexed streams share one classifier for the whole call, so each
/// source is loaded once. The first stream failure stops processing;
/// dropping `streams` tells the producer to stop. Buffered events are still flushed. An error reported by
/// the destination takes priority over a stream failure.
pub async fn process(
    mut streams: mpsc::Receiver<DataStream>,
    destination: Arc<dyn Destination>,
    builder: Arc<dyn ClassifierBuilder>,
) -> Result<ProcessSummary, ProcessError> {
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let destination_task =
        tokio::spawn(async move { destination.send_events(event_rx, error_tx).await });

    let mut summary = ProcessSummary::default();
    let mut stream_error = None;
    let mut multiplexed: Option<Box<dyn LineClassifier>> = None;
    while let Some(stream) = streams.recv().await {
        let location = stream.info.location();
        debug!(location = %location, "processing stream");
        let mut own = None;
        let classifier = if stream.info.multiplexed {
            match multiplexed {
                Some(ref mut shared) => Ok(shared),
                None => match builder.build(&stream.info).await {
                    Ok(classifier) => Ok(multiplexed.insert(classifier)),
                    Err(e) => Err(e),
                },
            }
        } else {
            match builder.build(&stream.info).await {
                Ok(classifier) => Ok(own.insert(classifier)),
                Err(e) => Err(e),
            }
        };
        let classifier = match classifier {
            Ok(classifier) => classifier,
            Err(source) => {
                stream_error = Some(ProcessError::Classifier { location, source });
                break;
            }
        };
        match Processor::new(stream, &mut **classifier)
            .run(&event_tx)
            .await
        {
            Ok(stats) => {
                summary.streams += 1;
                summary.stats += stats;
            }
            Err(e) => {
                stream_error = Some(e);
                break;
            }
        }
    }
    drop(streams);
    drop(event_tx);

    if let Err(e) = destination_task.await {
        return Err(ProcessError::DestinationTask(e.to_string()));
    }
    let mut destination_errors: Vec<DestinationError> = Vec::new();
    while let Ok(e) = error_rx.try_recv() {
        destination_errors.push(e);
    }
    if !destination_errors.is_empty() {
        error!(
            count = destination_errors.len(),
            "destination reported errors"
        );
        return Err(destination_errors.remove(0).into());
    }
    match stream_error {
        Some(e) => {
            error!("stream processing failed: {e}");
            Err(e)
        }
        None => Ok(summary),
    }
}
