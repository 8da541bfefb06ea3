// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{DeleteMessageBatchRequestEntry, QueueAttributeName};
use aws_sdk_sqs::Client;
use tracing::{debug, warn};

use crate::errors::QueueError;
use crate::stream::{QueueClient, QueueMessage};

/// Largest batch accepted by `DeleteMessageBatch`.
const DELETE_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    #[must_use]
    pub fn new(client: Client, queue_url: &str) -> Self {
        SqsQueue {
            client,
            queue_url: queue_url.to_string(),
        }
    }

    async fn delete_batch(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
        let entries = receipt_handles
            .iter()
            .enumerate()
            .map(|(i, handle)| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(i.to_string())
                    .receipt_handle(handle)
                    .build()
                    .map_err(|e| QueueError::Delete(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let output = self
            .client
            .delete_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| QueueError::Delete(DisplayErrorContext(&e).to_string()))?;
        let failed = output.failed();
        if !failed.is_empty() {
            return Err(QueueError::Delete(format!(
                "{} of {} messages not deleted, first error: {}",
                failed.len(),
                receipt_handles.len(),
                failed[0].message().unwrap_or(failed[0].code())
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for SqsQueue {
    async fn receive(
        &self,
        max_messages: i32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let wait_seconds = i32::try_from(wait.as_secs()).unwrap_or(i32::MAX);
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .send()
            .await
            .map_err(|e| QueueError::Receive(DisplayErrorContext(&e).to_string()))?;

        let messages: Vec<QueueMessage> = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                let Some(receipt_handle) = m.receipt_handle else {
                    warn!(message_id = ?m.message_id, "message without receipt handle");
                    return None;
                };
                Some(QueueMessage {
                    message_id: m.message_id.unwrap_or_default(),
                    receipt_handle,
                    body: m.body.unwrap_or_default(),
                })
            })
            .collect();
        debug!(count = messages.len(), wait_seconds, "received messages");
        Ok(messages)
    }

    async fn delete(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
        let mut first_error = None;
        for batch in receipt_handles.chunks(DELETE_BATCH_SIZE) {
            if let Err(e) = self.delete_batch(batch).await {
                warn!("{e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesDelayed)
            .send()
            .await
            .map_err(|e| QueueError::Attributes(DisplayErrorContext(&e).to_string()))?;
        let Some(attributes) = output.attributes() else {
            return Ok(0);
        };
        [
            QueueAttributeName::ApproximateNumberOfMessages,
            QueueAttributeName::ApproximateNumberOfMessagesDelayed,
        ]
        .iter()
        .filter_map(|name| attributes.get(name))
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|e| QueueError::Attributes(format!("bad count '{value}': {e}")))
        })
        .sum()
    }
}
