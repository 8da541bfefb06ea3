// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

#![allow(dead_code)]

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log_processor::{
    aws::decode::S3MessageDecoder,
    classification::sources::{SourceConfig, SourceLoader, StaticSourceLoader},
    destinations::s3::{S3Destination, S3DestinationConfig},
    parsers::{json::JsonParserConfig, Registry},
    processor::RegistryClassifierBuilder,
};
use serde_json::Value;

use super::mocks::{MemoryObjectStore, RecordingNotifier};

pub const RAW_BUCKET: &str = "raw-logs";
pub const PROCESSED_BUCKET: &str = "processed-logs";

pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

pub fn gunzip_rows(bytes: &[u8]) -> Vec<Value> {
    let mut text = String::new();
    GzDecoder::new(bytes).read_to_string(&mut text).unwrap();
    text.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Body of an S3 object-created notification.
pub fn s3_notification(bucket: &str, key: &str) -> String {
    serde_json::json!({
        "Records": [{
            "eventSource": "aws:s3",
            "eventName": "ObjectCreated:Put",
            "s3": {"bucket": {"name": bucket}, "object": {"key": key}}
        }]
    })
    .to_string()
}

/// Trigger payload as delivered by the queue event source.
pub fn trigger_json(records: &[(&str, &str)]) -> String {
    let records: Vec<Value> = records
        .iter()
        .map(|(receipt_handle, body)| {
            serde_json::json!({
                "messageId": format!("trigger-{receipt_handle}"),
                "receiptHandle": receipt_handle,
                "body": body,
                "eventSource": "aws:sqs",
            })
        })
        .collect();
    serde_json::json!({ "Records": records }).to_string()
}

pub struct Pipeline {
    pub store: Arc<MemoryObjectStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub destination: Arc<S3Destination>,
    pub decoder: Arc<S3MessageDecoder>,
    pub builder: Arc<RegistryClassifierBuilder>,
}

/// The one configured source: `edge-1`, labelled `edge`, sending `Custom.JSON`.
pub fn edge_sources() -> StaticSourceLoader {
    StaticSourceLoader::new(vec![SourceConfig {
        id: "edge-1".to_string(),
        label: "edge".to_string(),
        log_types: vec!["Custom.JSON".to_string()],
    }])
}

/// Pipeline with `Custom.Audit` (timestamped, requires `actor`) and
/// `Custom.JSON` registered, in that order.
pub fn pipeline() -> Pipeline {
    pipeline_with_sources(Arc::new(edge_sources()))
}

pub fn pipeline_with_sources(sources: Arc<dyn SourceLoader>) -> Pipeline {
    let mut registry = Registry::new();
    registry
        .register(
            "Custom.Audit",
            JsonParserConfig {
                log_type: "Custom.Audit".to_string(),
                timestamp_field: Some("time".to_string()),
                required_fields: vec!["actor".to_string()],
            }
            .into_factory(),
        )
        .unwrap();
    registry
        .register("Custom.JSON", JsonParserConfig::new("Custom.JSON").into_factory())
        .unwrap();

    let store = Arc::new(MemoryObjectStore::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let destination = Arc::new(S3Destination::new(
        S3DestinationConfig::new(PROCESSED_BUCKET),
        store.clone(),
        notifier.clone(),
    ));
    Pipeline {
        decoder: Arc::new(S3MessageDecoder::new(store.clone())),
        builder: Arc::new(RegistryClassifierBuilder::new(Arc::new(registry), sources)),
        store,
        notifier,
        destination,
    }
}
