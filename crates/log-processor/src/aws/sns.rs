// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::types::MessageAttributeValue;
use aws_sdk_sns::Client;

use crate::destinations::{Notification, Notifier, DATA_KIND};
use crate::errors::NotifyError;

/// Publishes notifications to a topic with `type` and `id` attributes so
/// subscribers can filter by data kind and log type.
#[derive(Debug, Clone)]
pub struct SnsNotifier {
    client: Client,
    topic_arn: String,
}

impl SnsNotifier {
    #[must_use]
    pub fn new(client: Client, topic_arn: &str) -> Self {
        SnsNotifier {
            client,
            topic_arn: topic_arn.to_string(),
        }
    }
}

fn string_attribute(value: &str) -> Result<MessageAttributeValue, String> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(|e| e.to_string())
}

#[async_trait]
impl Notifier for SnsNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let notify_error = |message: String| NotifyError {
            key: notification.key.clone(),
            message,
        };
        let message = serde_json::to_string(notification).map_err(|e| notify_error(e.to_string()))?;
        self.client
            .publish()
            .topic_arn(&self.topic_arn)
            .message(message)
            .message_attributes("type", string_attribute(DATA_KIND).map_err(notify_error)?)
            .message_attributes(
                "id",
                string_attribute(&notification.log_type).map_err(notify_error)?,
            )
            .send()
            .await
            .map_err(|e| notify_error(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}
