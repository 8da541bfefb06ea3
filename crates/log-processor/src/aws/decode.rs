// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoding of queue message bodies into data streams.
//!
//! Accepted bodies:
//! - S3 event notifications, bare or wrapped in an SNS envelope; each
//!   created object becomes one stream,
//! - source envelopes (`{"sourceId": ..., "payload": ...}`), which become
//!   single-line multiplexed streams.
//!
//! S3 test events decode to no streams.
//!
//! Objects are never read into memory here: a stream wraps the object body
//! and decompresses it as the processor reads lines.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use crate::classification::sources::SourceEnvelope;
use crate::errors::DecodeError;
use crate::processor::{DataStream, StreamHints, StreamInfo};
use crate::stream::MessageDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// An opened object: its body, not yet read, and its metadata.
pub struct ObjectBody {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_type", &self.content_type)
            .field("content_encoding", &self.content_encoding)
            .finish_non_exhaustive()
    }
}

impl ObjectBody {
    #[must_use]
    pub fn new(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        ObjectBody {
            reader,
            content_type: None,
            content_encoding: None,
        }
    }

    /// Body held in memory.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::new(Box::new(Cursor::new(bytes)))
    }

    fn declares_gzip(&self) -> bool {
        self.content_encoding.as_deref() == Some("gzip")
            || self.content_type.as_deref() == Some("application/x-gzip")
    }
}

#[async_trait]
pub trait ObjectReader: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, DecodeError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnsEnvelope {
    #[serde(rename = "Type")]
    kind: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct S3Notification {
    #[serde(rename = "Records", default)]
    records: Vec<S3Record>,
}

#[derive(Debug, Deserialize)]
struct S3Record {
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
}

/// Decoder for bodies referring to S3 objects or carrying source envelopes.
pub struct S3MessageDecoder {
    objects: Arc<dyn ObjectReader>,
}

impl S3MessageDecoder {
    #[must_use]
    pub fn new(objects: Arc<dyn ObjectReader>) -> Self {
        S3MessageDecoder { objects }
    }

    /// Opens an object as a stream. Only the first chunk of the body is
    /// read, to sniff the gzip magic.
    async fn open(&self, bucket: String, key: String) -> Result<DataStream, DecodeError> {
        let object = self.objects.get_object(&bucket, &key).await?;
        let gzip_declared = object.declares_gzip();
        let content_type = object.content_type;
        let mut body = BufReader::new(object.reader);
        let head = body.fill_buf().await.map_err(|source| DecodeError::Read {
            bucket: bucket.clone(),
            key: key.clone(),
            source,
        })?;
        let gzip = gzip_declared || head.starts_with(&GZIP_MAGIC);

        let reader: Box<dyn AsyncRead + Send + Unpin> = if gzip {
            let mut decoder = GzipDecoder::new(body);
            decoder.multiple_members(true);
            Box::new(decoder)
        } else {
            Box::new(body)
        };
        debug!(bucket = %bucket, key = %key, gzip, "opened object");
        Ok(DataStream::new(reader).with_info(StreamInfo {
            hints: StreamHints {
                s3_bucket: Some(bucket),
                s3_key: Some(key),
                content_type,
            },
            ..Default::default()
        }))
    }

    async fn decode_value(&self, value: Value) -> Result<Vec<DataStream>, DecodeError> {
        if value.get("Event").and_then(Value::as_str) == Some("s3:TestEvent") {
            debug!("ignoring S3 test event");
            return Ok(Vec::new());
        }
        if value.get("Records").is_some() {
            let notification: S3Notification = serde_json::from_value(value)
                .map_err(|e| DecodeError::InvalidBody(format!("bad S3 notification: {e}")))?;
            let mut streams = Vec::with_capacity(notification.records.len());
            for record in notification.records {
                let key = decode_object_key(&record.s3.object.key)?;
                streams.push(self.open(record.s3.bucket.name, key).await?);
            }
            return Ok(streams);
        }
        if value.get("sourceId").is_some() {
            let envelope: SourceEnvelope = serde_json::from_value(value.clone())
                .map_err(|e| DecodeError::InvalidBody(format!("bad source envelope: {e}")))?;
            let line = format!("{value}\n");
            return Ok(vec![DataStream::new(Box::new(Cursor::new(line.into_bytes())))
                .with_info(StreamInfo {
                    source_id: Some(envelope.source_id),
                    multiplexed: true,
                    ..Default::default()
                })]);
        }
        Err(DecodeError::InvalidBody(
            "expected an S3 notification or a source envelope".to_string(),
        ))
    }
}

#[async_trait]
impl MessageDecoder for S3MessageDecoder {
    async fn decode(&self, body: &str) -> Result<Vec<DataStream>, DecodeError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| DecodeError::InvalidBody(e.to_string()))?;
        if value.get("Type").is_some() && value.get("Message").is_some() {
            let envelope: SnsEnvelope = serde_json::from_value(value)
                .map_err(|e| DecodeError::InvalidBody(format!("bad SNS envelope: {e}")))?;
            debug!(kind = %envelope.kind, "unwrapping SNS envelope");
            let inner: Value = serde_json::from_str(&envelope.message)
                .map_err(|e| DecodeError::InvalidBody(format!("bad SNS message: {e}")))?;
            return self.decode_value(inner).await;
        }
        self.decode_value(value).await
    }
}

/// Decodes an object key from an S3 notification, which is URL-encoded
/// with `+` for spaces.
pub fn decode_object_key(raw: &str) -> Result<String, DecodeError> {
    let bad_key = || DecodeError::InvalidBody(format!("bad object key '{raw}'"));
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = [bytes.next().ok_or_else(bad_key)?, bytes.next().ok_or_else(bad_key)?];
                let hex = std::str::from_utf8(&hex).map_err(|_| bad_key())?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| bad_key())?);
            }
            other => out.push(other),
        }
    }
    String::from_utf8(out).map_err(|_| bad_key())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::{HashMap, VecDeque};
    use std::io::{self, Write};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, ReadBuf};

    #[derive(Default)]
    struct MemoryObjects {
        objects: HashMap<(String, String), Vec<u8>>,
        chunked: Mutex<Option<ChunkedReader>>,
    }

    impl MemoryObjects {
        fn with(mut self, bucket: &str, key: &str, bytes: Vec<u8>) -> Self {
            self.objects
                .insert((bucket.to_string(), key.to_string()), bytes);
            self
        }

        /// Serves `reader` for the next lookup, whatever the key.
        fn serving(self, reader: ChunkedReader) -> Self {
            *self.chunked.lock().unwrap() = Some(reader);
            self
        }
    }

    #[async_trait]
    impl ObjectReader for MemoryObjects {
        async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, DecodeError> {
            if let Some(reader) = self.chunked.lock().unwrap().take() {
                return Ok(ObjectBody::new(Box::new(reader)));
            }
            self.objects
                .get(&(bucket.to_string(), key.to_string()))
                .map(|bytes| ObjectBody::from_bytes(bytes.clone()))
                .ok_or_else(|| DecodeError::Open {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    message: "NoSuchKey".to_string(),
                })
        }
    }

    /// Body that hands out one chunk per read and counts the reads.
    struct ChunkedReader {
        chunks: VecDeque<Vec<u8>>,
        reads: Arc<AtomicUsize>,
    }

    impl ChunkedReader {
        fn new(chunks: Vec<Vec<u8>>) -> (Self, Arc<AtomicUsize>) {
            let reads = Arc::new(AtomicUsize::new(0));
            let reader = ChunkedReader {
                chunks: chunks.into(),
                reads: Arc::clone(&reads),
            };
            (reader, reads)
        }
    }

    impl AsyncRead for ChunkedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if let Some(chunk) = self.chunks.pop_front() {
                buf.put_slice(&chunk);
            }
            Poll::Ready(Ok(()))
        }
    }

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn s3_notification(bucket: &str, key: &str) -> String {
        serde_json::json!({
            "Records": [{
                "eventName": "ObjectCreated:Put",
                "s3": {"bucket": {"name": bucket}, "object": {"key": key, "size": 10}}
            }]
        })
        .to_string()
    }

    async fn read_all(stream: DataStream) -> String {
        let mut text = String::new();
        let mut reader = stream.reader;
        reader.read_to_string(&mut text).await.unwrap();
        text
    }

    #[tokio::test]
    async fn test_decodes_bare_notification_with_gzip_object() {
        let objects = MemoryObjects::default().with("raw", "logs/a b.gz", gzip("line1\nline2\n"));
        let decoder = S3MessageDecoder::new(Arc::new(objects));

        let mut streams = decoder
            .decode(&s3_notification("raw", "logs/a+b.gz"))
            .await
            .unwrap();
        assert_eq!(streams.len(), 1);
        let stream = streams.remove(0);
        assert_eq!(stream.info.location(), "s3://raw/logs/a b.gz");
        assert!(!stream.info.multiplexed);
        assert_eq!(read_all(stream).await, "line1\nline2\n");
    }

    #[tokio::test]
    async fn test_object_is_read_only_as_lines_are_consumed() {
        let chunks = vec![b"line1\n".to_vec(), b"line2\n".to_vec(), b"line3\n".to_vec()];
        let (reader, reads) = ChunkedReader::new(chunks);
        let objects = MemoryObjects::default().serving(reader);
        let decoder = S3MessageDecoder::new(Arc::new(objects));

        let streams = decoder.decode(&s3_notification("raw", "big.log")).await.unwrap();
        // Only the first chunk was pulled to sniff the encoding.
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        let text = read_all(streams.into_iter().next().unwrap()).await;
        assert_eq!(text, "line1\nline2\nline3\n");
        assert!(reads.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_concatenated_gzip_members_are_all_read() {
        let mut bytes = gzip("first\n");
        bytes.extend(gzip("second\n"));
        let objects = MemoryObjects::default().with("raw", "multi.gz", bytes);
        let decoder = S3MessageDecoder::new(Arc::new(objects));

        let streams = decoder.decode(&s3_notification("raw", "multi.gz")).await.unwrap();
        assert_eq!(
            read_all(streams.into_iter().next().unwrap()).await,
            "first\nsecond\n"
        );
    }

    #[tokio::test]
    async fn test_corrupt_gzip_fails_when_read() {
        let mut bytes = gzip("line1\nline2\n");
        bytes.truncate(bytes.len() / 2);
        let objects = MemoryObjects::default().with("raw", "broken.gz", bytes);
        let decoder = S3MessageDecoder::new(Arc::new(objects));

        let streams = decoder.decode(&s3_notification("raw", "broken.gz")).await.unwrap();
        let mut text = String::new();
        let mut reader = streams.into_iter().next().unwrap().reader;
        assert!(reader.read_to_string(&mut text).await.is_err());
    }

    #[tokio::test]
    async fn test_decodes_sns_wrapped_notification() {
        let objects = MemoryObjects::default().with("raw", "plain.log", b"hello\n".to_vec());
        let decoder = S3MessageDecoder::new(Arc::new(objects));
        let body = serde_json::json!({
            "Type": "Notification",
            "Message": s3_notification("raw", "plain.log"),
        })
        .to_string();

        let streams = decoder.decode(&body).await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(read_all(streams.into_iter().next().unwrap()).await, "hello\n");
    }

    #[tokio::test]
    async fn test_ignores_test_event() {
        let decoder = S3MessageDecoder::new(Arc::new(MemoryObjects::default()));
        let streams = decoder
            .decode(r#"{"Service":"Amazon S3","Event":"s3:TestEvent","Bucket":"raw"}"#)
            .await
            .unwrap();
        assert!(streams.is_empty());
    }

    #[tokio::test]
    async fn test_source_envelope_becomes_multiplexed_stream() {
        let decoder = S3MessageDecoder::new(Arc::new(MemoryObjects::default()));
        let streams = decoder
            .decode(r#"{"sourceId":"src-1","payload":"{\"k\":1}"}"#)
            .await
            .unwrap();
        assert_eq!(streams.len(), 1);
        let stream = streams.into_iter().next().unwrap();
        assert!(stream.info.multiplexed);
        assert_eq!(stream.info.source_id.as_deref(), Some("src-1"));

        let line = read_all(stream).await;
        let envelope: SourceEnvelope = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(envelope.payload, "{\"k\":1}");
    }

    #[tokio::test]
    async fn test_invalid_bodies() {
        let decoder = S3MessageDecoder::new(Arc::new(MemoryObjects::default()));
        assert!(matches!(
            decoder.decode("not json").await,
            Err(DecodeError::InvalidBody(_))
        ));
        assert!(matches!(
            decoder.decode(r#"{"hello":"world"}"#).await,
            Err(DecodeError::InvalidBody(_))
        ));
        assert!(matches!(
            decoder.decode(&s3_notification("raw", "missing")).await,
            Err(DecodeError::Open { .. })
        ));
    }

    #[test]
    fn test_decode_object_key() {
        assert_eq!(decode_object_key("a%2Fb+c.log").unwrap(), "a/b c.log");
        assert_eq!(decode_object_key("plain").unwrap(), "plain");
        assert!(decode_object_key("bad%2").is_err());
    }
}
