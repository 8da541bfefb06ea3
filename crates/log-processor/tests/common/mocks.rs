// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory implementations of the pipeline's external collaborators

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log_processor::{
    aws::decode::{ObjectBody, ObjectReader},
    classification::sources::{SourceConfig, SourceLoader, StaticSourceLoader},
    destinations::{Notification, Notifier, ObjectUploader},
    errors::{DecodeError, InvokeError, NotifyError, QueueError, SourceError, UploadError},
    scaling::FunctionInvoker,
    stream::{QueueClient, QueueMessage},
};

/// Object store shared by the raw input and the processed output.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    uploads: Mutex<Vec<(String, String)>>,
    fail_uploads: AtomicBool,
}

impl MemoryObjectStore {
    pub fn insert(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), bytes);
    }

    pub fn fail_uploads(&self) {
        self.fail_uploads.store(true, Ordering::SeqCst);
    }

    /// Keys uploaded through [`ObjectUploader`], in upload order.
    pub fn uploaded_keys(&self, bucket: &str) -> Vec<String> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ObjectUploader for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _content_encoding: &str,
    ) -> Result<(), UploadError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(UploadError {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "service unavailable".to_string(),
            });
        }
        self.insert(bucket, key, body);
        self.uploads
            .lock()
            .unwrap()
            .push((bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ObjectReader for MemoryObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, DecodeError> {
        self.object(bucket, key)
            .map(ObjectBody::from_bytes)
            .ok_or_else(|| DecodeError::Open {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "NoSuchKey".to_string(),
            })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Queue serving scripted receive batches.
///
/// Once the script runs out, receives return `endless` (if set) or nothing.
#[derive(Default)]
pub struct FakeQueue {
    batches: Mutex<VecDeque<Vec<QueueMessage>>>,
    endless: Mutex<Option<String>>,
    receive_delay: Mutex<Duration>,
    waits: Mutex<Vec<Duration>>,
    deleted: Mutex<Vec<String>>,
    depth: AtomicU64,
    next_id: AtomicUsize,
}

impl FakeQueue {
    pub fn push_batch(&self, bodies: &[&str]) {
        let batch = bodies.iter().map(|body| self.message(body)).collect();
        self.batches.lock().unwrap().push_back(batch);
    }

    /// Every receive past the script returns one message with `body`.
    pub fn set_endless(&self, body: &str, delay: Duration) {
        *self.endless.lock().unwrap() = Some(body.to_string());
        *self.receive_delay.lock().unwrap() = delay;
    }

    pub fn set_depth(&self, depth: u64) {
        self.depth.store(depth, Ordering::SeqCst);
    }

    pub fn message(&self, body: &str) -> QueueMessage {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        QueueMessage {
            message_id: format!("m-{id}"),
            receipt_handle: format!("r-{id}"),
            body: body.to_string(),
        }
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueClient for FakeQueue {
    async fn receive(
        &self,
        _max_messages: i32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.waits.lock().unwrap().push(wait);
        if let Some(batch) = self.batches.lock().unwrap().pop_front() {
            return Ok(batch);
        }
        let endless = self.endless.lock().unwrap().clone();
        match endless {
            Some(body) => {
                let delay = *self.receive_delay.lock().unwrap();
                tokio::time::sleep(delay).await;
                Ok(vec![self.message(&body)])
            }
            None => Ok(Vec::new()),
        }
    }

    async fn delete(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
        self.deleted
            .lock()
            .unwrap()
            .extend(receipt_handles.iter().cloned());
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.depth.load(Ordering::SeqCst))
    }
}

/// Source loader that counts every lookup.
pub struct CountingSourceLoader {
    inner: StaticSourceLoader,
    pub calls: AtomicUsize,
}

impl CountingSourceLoader {
    pub fn new(inner: StaticSourceLoader) -> Self {
        CountingSourceLoader {
            inner,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SourceLoader for CountingSourceLoader {
    async fn load_source(&self, source_id: &str) -> Result<SourceConfig, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.load_source(source_id).await
    }
}

#[derive(Default)]
pub struct RecordingInvoker {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl FunctionInvoker for RecordingInvoker {
    async fn invoke_async(&self, payload: &[u8]) -> Result<(), InvokeError> {
        assert_eq!(payload, br#"{"tick":true}"#);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(InvokeError {
                function: "log-processor".to_string(),
                message: "TooManyRequestsException".to_string(),
            });
        }
        Ok(())
    }
}
