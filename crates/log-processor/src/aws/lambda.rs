// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use aws_sdk_lambda::error::DisplayErrorContext;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::InvocationType;
use aws_sdk_lambda::Client;

use crate::errors::InvokeError;
use crate::scaling::FunctionInvoker;

#[derive(Debug, Clone)]
pub struct LambdaInvoker {
    client: Client,
    function_name: String,
}

impl LambdaInvoker {
    #[must_use]
    pub fn new(client: Client, function_name: &str) -> Self {
        LambdaInvoker {
            client,
            function_name: function_name.to_string(),
        }
    }
}

#[async_trait]
impl FunctionInvoker for LambdaInvoker {
    async fn invoke_async(&self, payload: &[u8]) -> Result<(), InvokeError> {
        self.client
            .invoke()
            .function_name(&self.function_name)
            .invocation_type(InvocationType::Event)
            .payload(Blob::new(payload.to_vec()))
            .send()
            .await
            .map_err(|e| InvokeError {
                function: self.function_name.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }
}
