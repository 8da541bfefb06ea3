// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations consume parsed events and land them in durable storage.

pub mod buffer;
pub mod s3;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::{DestinationError, NotifyError, UploadError};
use crate::parsers::ParsedEvent;

/// Value of the `type` attribute on every notification.
pub const DATA_KIND: &str = "LogData";

/// Announces one object written to the log bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub bucket: String,
    pub key: String,
    pub events: u64,
    /// Uncompressed size of the written lines.
    pub bytes: u64,
    pub log_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_label: Option<String>,
}

/// Durable object storage.
#[async_trait]
pub trait ObjectUploader: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_encoding: &str,
    ) -> Result<(), UploadError>;
}

/// Publishes notifications to the catalog subsystem.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// Consumes `events` until the channel closes, then flushes everything
    /// still buffered and returns. Errors are reported on `errors` and never
    /// stop the destination.
    async fn send_events(
        &self,
        events: mpsc::Receiver<ParsedEvent>,
        errors: mpsc::UnboundedSender<DestinationError>,
    );
}
