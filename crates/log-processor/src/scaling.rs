// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scale-out controller.
//!
//! Periodically checks the queue backlog and starts extra workers by
//! invoking the function with a tick payload. Scaling is best effort:
//! failures are logged and the next tick re-evaluates the backlog.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::InvokeError;
use crate::stream::QueueClient;

/// Payload sent to extra workers.
pub const TICK_PAYLOAD: &[u8] = br#"{"tick":true}"#;

/// Fire-and-forget function invocation.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke_async(&self, payload: &[u8]) -> Result<(), InvokeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingConfig {
    pub interval: Duration,
    /// Backlog one worker is expected to drain.
    pub messages_per_worker: u64,
    pub max_workers_per_tick: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        ScalingConfig {
            interval: Duration::from_secs(30),
            messages_per_worker: 5000,
            max_workers_per_tick: 10,
        }
    }
}

impl ScalingConfig {
    #[must_use]
    pub fn desired_workers(&self, depth: u64) -> u64 {
        (depth / self.messages_per_worker.max(1)).min(self.max_workers_per_tick)
    }
}

pub struct Scaler {
    config: ScalingConfig,
    queue: Arc<dyn QueueClient>,
    invoker: Arc<dyn FunctionInvoker>,
}

impl Scaler {
    #[must_use]
    pub fn new(
        config: ScalingConfig,
        queue: Arc<dyn QueueClient>,
        invoker: Arc<dyn FunctionInvoker>,
    ) -> Self {
        Scaler {
            config,
            queue,
            invoker,
        }
    }

    /// Runs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the worker that just started
        // is already draining the queue.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("scaler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One scaling round. Returns the number of workers started.
    pub async fn tick(&self) -> u64 {
        let depth = match self.queue.depth().await {
            Ok(depth) => depth,
            Err(e) => {
                warn!("failed to read queue depth: {e}");
                return 0;
            }
        };
        let desired = self.config.desired_workers(depth);
        if desired == 0 {
            debug!(depth, "no scale out needed");
            return 0;
        }

        let mut invocations = JoinSet::new();
        for _ in 0..desired {
            let invoker = Arc::clone(&self.invoker);
            invocations.spawn(async move { invoker.invoke_async(TICK_PAYLOAD).await });
        }
        let mut started = 0;
        while let Some(result) = invocations.join_next().await {
            match result {
                Ok(Ok(())) => started += 1,
                Ok(Err(e)) => warn!("scale out invocation failed: {e}"),
                Err(e) => warn!("scale out task failed: {e}"),
            }
        }
        metrics::counter!("log_processor.scale_out_invocations").increment(started);
        info!(depth, desired, started, "scaled out");
        started
    }
}
