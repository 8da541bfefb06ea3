// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-partition event buffers.
//!
//! A [`BufferSet`] is owned by exactly one task. Buffers leave the set
//! through [`BufferSet::remove`] and friends and are then finished and
//! uploaded elsewhere.

use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::time::Instant;

use crate::parsers::ParsedEvent;

/// Partition of an event: its UTC hour and log type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub hour: DateTime<Utc>,
    pub log_type: String,
}

impl PartitionKey {
    #[must_use]
    pub fn for_event(event: &ParsedEvent) -> Self {
        PartitionKey {
            hour: event.hour(),
            log_type: event.log_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BufferSource {
    Unknown,
    Single { id: String, label: String },
    Mixed,
}

/// Gzip-compressed newline-delimited events of one partition.
pub struct EventBuffer {
    key: PartitionKey,
    writer: GzEncoder<Vec<u8>>,
    bytes: u64,
    events: u64,
    created_at: Instant,
    source: BufferSource,
}

impl std::fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBuffer")
            .field("key", &self.key)
            .field("bytes", &self.bytes)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// A finished buffer ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBuffer {
    pub key: PartitionKey,
    pub body: Vec<u8>,
    pub bytes: u64,
    pub events: u64,
    pub source_id: Option<String>,
    pub source_label: Option<String>,
}

impl EventBuffer {
    #[must_use]
    pub fn new(key: PartitionKey, now: Instant) -> Self {
        EventBuffer {
            key,
            writer: GzEncoder::new(Vec::new(), Compression::default()),
            bytes: 0,
            events: 0,
            created_at: now,
            source: BufferSource::Unknown,
        }
    }

    pub fn append(&mut self, event: &ParsedEvent, line: &[u8]) -> io::Result<()> {
        self.writer.write_all(line)?;
        self.bytes += line.len() as u64;
        self.events += 1;
        let next = match (&self.source, &event.source_id) {
            (BufferSource::Unknown, Some(id)) if self.events == 1 => Some(BufferSource::Single {
                id: id.clone(),
                label: event.source_label.clone().unwrap_or_default(),
            }),
            (BufferSource::Single { id, .. }, Some(event_id)) if id == event_id => None,
            (BufferSource::Unknown, None) | (BufferSource::Mixed, _) => None,
            _ => Some(BufferSource::Mixed),
        };
        if let Some(next) = next {
            self.source = next;
        }
        Ok(())
    }

    #[must_use]
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Uncompressed bytes written so far.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn events(&self) -> u64 {
        self.events
    }

    #[must_use]
    pub fn is_expired(&self, max_age: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= max_age
    }

    /// Completes the gzip stream.
    pub fn seal(self) -> io::Result<SealedBuffer> {
        let body = self.writer.finish()?;
        let (source_id, source_label) = match self.source {
            BufferSource::Single { id, label } => (Some(id), Some(label)),
            BufferSource::Unknown | BufferSource::Mixed => (None, None),
        };
        Ok(SealedBuffer {
            key: self.key,
            body,
            bytes: self.bytes,
            events: self.events,
            source_id,
            source_label,
        })
    }
}

/// Live buffers keyed by partition, with a running byte total.
#[derive(Debug, Default)]
pub struct BufferSet {
    buffers: HashMap<PartitionKey, EventBuffer>,
    total_bytes: u64,
}

impl BufferSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a serialized event, creating the buffer if needed.
    /// Returns the partition's byte size after the append.
    pub fn append(
        &mut self,
        key: &PartitionKey,
        event: &ParsedEvent,
        line: &[u8],
        now: Instant,
    ) -> io::Result<u64> {
        let buffer = self
            .buffers
            .entry(key.clone())
            .or_insert_with(|| EventBuffer::new(key.clone(), now));
        buffer.append(event, line)?;
        self.total_bytes += line.len() as u64;
        Ok(buffer.bytes())
    }

    #[must_use]
    pub fn bytes_of(&self, key: &PartitionKey) -> u64 {
        self.buffers.get(key).map_or(0, EventBuffer::bytes)
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn remove(&mut self, key: &PartitionKey) -> Option<EventBuffer> {
        let buffer = self.buffers.remove(key)?;
        self.total_bytes -= buffer.bytes();
        Some(buffer)
    }

    /// Unlinks the buffer holding the most bytes.
    pub fn remove_largest(&mut self) -> Option<EventBuffer> {
        let key = self
            .buffers
            .values()
            .max_by_key(|b| b.bytes())
            .map(|b| b.key().clone())?;
        self.remove(&key)
    }

    /// Unlinks every buffer at least `max_age` old.
    pub fn take_expired(&mut self, max_age: Duration, now: Instant) -> Vec<EventBuffer> {
        let expired: Vec<PartitionKey> = self
            .buffers
            .values()
            .filter(|b| b.is_expired(max_age, now))
            .map(|b| b.key().clone())
            .collect();
        expired.iter().filter_map(|key| self.remove(key)).collect()
    }

    pub fn drain(&mut self) -> Vec<EventBuffer> {
        self.total_bytes = 0;
        self.buffers.drain().map(|(_, buffer)| buffer).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;

    fn event(log_type: &str, hour: u32) -> ParsedEvent {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, hour, 30, 0).unwrap();
        ParsedEvent::new(log_type, Some(ts), json!({"h": hour}))
    }

    #[test]
    fn test_partition_key_uses_event_hour() {
        let key = PartitionKey::for_event(&event("A", 7));
        assert_eq!(key.hour, Utc.with_ymd_and_hms(2024, 3, 9, 7, 0, 0).unwrap());
        assert_eq!(key.log_type, "A");
    }

    #[test]
    fn test_sealed_buffer_decompresses_in_order() {
        let first = event("A", 1);
        let second = event("A", 1);
        let mut buffer = EventBuffer::new(PartitionKey::for_event(&first), Instant::now());
        buffer.append(&first, b"one\n").unwrap();
        buffer.append(&second, b"two\n").unwrap();

        let sealed = buffer.seal().unwrap();
        assert_eq!(sealed.events, 2);
        assert_eq!(sealed.bytes, 8);

        let mut text = String::new();
        GzDecoder::new(sealed.body.as_slice())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "one\ntwo\n");
    }

    #[test]
    fn test_buffer_source_tracking() {
        let a1 = event("A", 1).with_source("s1", "one");
        let a2 = event("A", 1).with_source("s1", "one");
        let b = event("A", 1).with_source("s2", "two");

        let mut single = EventBuffer::new(PartitionKey::for_event(&a1), Instant::now());
        single.append(&a1, b"x\n").unwrap();
        single.append(&a2, b"x\n").unwrap();
        let sealed = single.seal().unwrap();
        assert_eq!(sealed.source_id.as_deref(), Some("s1"));
        assert_eq!(sealed.source_label.as_deref(), Some("one"));

        let mut mixed = EventBuffer::new(PartitionKey::for_event(&a1), Instant::now());
        mixed.append(&a1, b"x\n").unwrap();
        mixed.append(&b, b"x\n").unwrap();
        assert_eq!(mixed.seal().unwrap().source_id, None);
    }

    #[test]
    fn test_set_tracks_total_and_largest() {
        let mut set = BufferSet::new();
        let now = Instant::now();
        let small = event("A", 1);
        let large = event("B", 1);
        let small_key = PartitionKey::for_event(&small);
        let large_key = PartitionKey::for_event(&large);

        set.append(&small_key, &small, b"12\n", now).unwrap();
        let size = set.append(&large_key, &large, b"123456\n", now).unwrap();
        assert_eq!(size, 7);
        assert_eq!(set.total_bytes(), 10);
        assert_eq!(set.len(), 2);

        let largest = set.remove_largest().unwrap();
        assert_eq!(largest.key(), &large_key);
        assert_eq!(set.total_bytes(), 3);
        assert_eq!(set.bytes_of(&large_key), 0);

        assert_eq!(set.drain().len(), 1);
        assert_eq!(set.total_bytes(), 0);
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_expired() {
        let mut set = BufferSet::new();
        let old = event("A", 1);
        let fresh = event("A", 2);
        set.append(&PartitionKey::for_event(&old), &old, b"o\n", Instant::now())
            .unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        set.append(&PartitionKey::for_event(&fresh), &fresh, b"f\n", Instant::now())
            .unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        let expired = set.take_expired(Duration::from_secs(60), Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key().hour.format("%H").to_string(), "01");
        assert_eq!(set.len(), 1);
        assert_eq!(set.total_bytes(), 2);
    }
}
