// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the ingestion pipeline.

use thiserror::Error;

/// Error returned by a parser that does not recognize a line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid line: {0}")]
    InvalidLine(String),
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("parser panicked: {0}")]
    Panicked(String),
}

/// Errors raised while building or querying the parser registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("log type '{0}' is already registered")]
    Duplicate(String),
    #[error("log type '{0}' is not registered")]
    UnknownLogType(String),
    #[error("failed to create parser for '{log_type}': {message}")]
    ParserCreation { log_type: String, message: String },
}

/// Failure to resolve a source configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("source '{0}' not found")]
    NotFound(String),
    #[error("failed to load source '{source_id}': {message}")]
    Load { source_id: String, message: String },
}

/// Structural classification errors.
///
/// An unrecognized line is not an error, see
/// [`crate::classification::ClassifierResult`].
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("failed to unwrap source envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to upload s3://{bucket}/{key}: {message}")]
pub struct UploadError {
    pub bucket: String,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to publish notification for {key}: {message}")]
pub struct NotifyError {
    pub key: String,
    pub message: String,
}

/// An event that cannot be written as a JSON row.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors reported by a destination on its error channel.
///
/// None of them stop the destination; the caller decides what is fatal.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("failed to serialize {log_type} event: {source}")]
    Serialize {
        log_type: String,
        #[source]
        source: SerializeError,
    },
    #[error("failed to buffer {log_type} events: {source}")]
    Buffer {
        log_type: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("upload workers stopped before all buffers were handed off")]
    WorkersGone,
}

/// Errors surfaced by [`crate::processor::process`].
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to read {location} at line {line_number}: {source}")]
    Read {
        location: String,
        line_number: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build classifier for {location}: {source}")]
    Classifier {
        location: String,
        #[source]
        source: ClassifyError,
    },
    #[error(transparent)]
    Destination(#[from] DestinationError),
    #[error("destination stopped early")]
    DestinationClosed,
    #[error("destination task failed: {0}")]
    DestinationTask(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("failed to receive messages: {0}")]
    Receive(String),
    #[error("failed to delete messages: {0}")]
    Delete(String),
    #[error("failed to read queue attributes: {0}")]
    Attributes(String),
}

/// Failure to turn a queue message into data streams.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid message body: {0}")]
    InvalidBody(String),
    #[error("failed to open s3://{bucket}/{key}: {message}")]
    Open {
        bucket: String,
        key: String,
        message: String,
    },
    #[error("failed to read s3://{bucket}/{key}: {source}")]
    Read {
        bucket: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to invoke {function}: {message}")]
pub struct InvokeError {
    pub function: String,
    pub message: String,
}

/// Terminal errors of one ingestion invocation.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("message reader task failed: {0}")]
    ReaderTask(String),
}

/// The invocation payload could not be loaded.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("failed to read invocation event {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid invocation event {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = UploadError {
            bucket: "bucket".to_string(),
            key: "logs/a.json.gz".to_string(),
            message: "access denied".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "failed to upload s3://bucket/logs/a.json.gz: access denied"
        );

        let error = ProcessError::Read {
            location: "s3://bucket/key".to_string(),
            line_number: 12,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "bad frame"),
        };
        assert_eq!(
            error.to_string(),
            "failed to read s3://bucket/key at line 12: bad frame"
        );

        let error = DestinationError::Serialize {
            log_type: "Custom.JSON".to_string(),
            source: SerializeError::NotAnObject("null"),
        };
        assert_eq!(
            error.to_string(),
            "failed to serialize Custom.JSON event: expected a JSON object, got null"
        );
    }

    #[test]
    fn test_transparent_errors_keep_message() {
        let error = StreamError::from(QueueError::Receive("throttled".to_string()));
        assert_eq!(error.to_string(), "failed to receive messages: throttled");

        let error = ClassifyError::from(SourceError::NotFound("abc".to_string()));
        assert_eq!(error.to_string(), "source 'abc' not found");
    }
}
