// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::debug;

use crate::aws::decode::{ObjectBody, ObjectReader};
use crate::destinations::ObjectUploader;
use crate::errors::{DecodeError, UploadError};

const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct S3Objects {
    client: Client,
}

impl S3Objects {
    #[must_use]
    pub fn new(client: Client) -> Self {
        S3Objects { client }
    }
}

#[async_trait]
impl ObjectUploader for S3Objects {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_encoding: &str,
    ) -> Result<(), UploadError> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(CONTENT_TYPE)
            .content_encoding(content_encoding)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| UploadError {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
        debug!(bucket, key, size, "uploaded object");
        Ok(())
    }
}

#[async_trait]
impl ObjectReader for S3Objects {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, DecodeError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| DecodeError::Open {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
        debug!(bucket, key, size = ?output.content_length, "opened object body");
        Ok(ObjectBody {
            reader: Box::new(Box::pin(output.body.into_async_read())),
            content_type: output.content_type,
            content_encoding: output.content_encoding,
        })
    }
}
