// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::destinations::s3::{
    S3DestinationConfig, DEFAULT_MAX_BUFFERED_BYTES, DEFAULT_MAX_BUFFER_AGE,
    DEFAULT_MAX_BUFFER_BYTES, DEFAULT_UPLOAD_WORKERS,
};
use crate::errors::ConfigError;
use crate::scaling::ScalingConfig;
use crate::stream::{StreamConfig, DEFAULT_INVOCATION_TIMEOUT, DEFAULT_PROCESSING_FRACTION};

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration of the log processor, read from `LOG_PROCESSOR_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Input queue URL
    pub queue_url: String,
    /// Bucket receiving processed logs
    pub bucket: String,
    /// Topic receiving one notification per written object
    pub notifications_topic: String,
    /// Function invoked for scale out; scaling is off when unset
    pub function_name: Option<String>,
    pub invocation_timeout: Duration,
    pub processing_fraction: f64,
    pub max_buffer_bytes: u64,
    pub max_buffered_bytes: u64,
    pub max_buffer_age: Duration,
    pub upload_workers: usize,
    pub scale_interval: Duration,
    pub messages_per_worker: u64,
    pub max_scale_per_tick: u64,
    /// JSON file with source configurations
    pub sources_file: Option<PathBuf>,
    /// Log types parsed by the generic JSON parser
    pub json_log_types: Vec<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        let scaling = ScalingConfig::default();
        Self {
            queue_url: String::new(),
            bucket: String::new(),
            notifications_topic: String::new(),
            function_name: None,
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            processing_fraction: DEFAULT_PROCESSING_FRACTION,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            max_buffer_age: DEFAULT_MAX_BUFFER_AGE,
            upload_workers: DEFAULT_UPLOAD_WORKERS,
            scale_interval: scaling.interval,
            messages_per_worker: scaling.messages_per_worker,
            max_scale_per_tick: scaling.max_workers_per_tick,
            sources_file: None,
            json_log_types: vec!["Custom.JSON".to_string()],
            log_level: "info".to_string(),
        }
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parsed<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            message: format!("'{value}': {e}"),
        }),
        Err(_) => Ok(default),
    }
}

fn seconds(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parsed(name, default.as_secs()).map(Duration::from_secs)
}

impl ProcessorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            queue_url: required("LOG_PROCESSOR_QUEUE_URL")?,
            bucket: required("LOG_PROCESSOR_BUCKET")?,
            notifications_topic: required("LOG_PROCESSOR_NOTIFICATIONS_TOPIC")?,
            function_name: env::var("LOG_PROCESSOR_FUNCTION_NAME")
                .ok()
                .filter(|name| !name.trim().is_empty()),
            invocation_timeout: seconds("LOG_PROCESSOR_TIMEOUT_SECS", defaults.invocation_timeout)?,
            processing_fraction: parsed(
                "LOG_PROCESSOR_PROCESSING_FRACTION",
                defaults.processing_fraction,
            )?,
            max_buffer_bytes: parsed("LOG_PROCESSOR_MAX_BUFFER_BYTES", defaults.max_buffer_bytes)?,
            max_buffered_bytes: parsed(
                "LOG_PROCESSOR_MAX_BUFFERED_BYTES",
                defaults.max_buffered_bytes,
            )?,
            max_buffer_age: seconds("LOG_PROCESSOR_MAX_BUFFER_AGE_SECS", defaults.max_buffer_age)?,
            upload_workers: parsed("LOG_PROCESSOR_UPLOAD_WORKERS", defaults.upload_workers)?,
            scale_interval: seconds("LOG_PROCESSOR_SCALE_INTERVAL_SECS", defaults.scale_interval)?,
            messages_per_worker: parsed(
                "LOG_PROCESSOR_MESSAGES_PER_WORKER",
                defaults.messages_per_worker,
            )?,
            max_scale_per_tick: parsed(
                "LOG_PROCESSOR_MAX_SCALE_PER_TICK",
                defaults.max_scale_per_tick,
            )?,
            sources_file: env::var("LOG_PROCESSOR_SOURCES_FILE").ok().map(PathBuf::from),
            json_log_types: env::var("LOG_PROCESSOR_JSON_LOG_TYPES")
                .map(|val| {
                    val.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.json_log_types),
            log_level: env::var("LOG_PROCESSOR_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("LOG_PROCESSOR_QUEUE_URL", &self.queue_url),
            ("LOG_PROCESSOR_BUCKET", &self.bucket),
            ("LOG_PROCESSOR_NOTIFICATIONS_TOPIC", &self.notifications_topic),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }

        if !(self.processing_fraction > 0.0 && self.processing_fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                name: "LOG_PROCESSOR_PROCESSING_FRACTION",
                message: format!("{} is not in (0, 1]", self.processing_fraction),
            });
        }

        let positive = [
            ("LOG_PROCESSOR_TIMEOUT_SECS", self.invocation_timeout.as_secs()),
            ("LOG_PROCESSOR_MAX_BUFFER_BYTES", self.max_buffer_bytes),
            ("LOG_PROCESSOR_MAX_BUFFERED_BYTES", self.max_buffered_bytes),
            ("LOG_PROCESSOR_MAX_BUFFER_AGE_SECS", self.max_buffer_age.as_secs()),
            ("LOG_PROCESSOR_UPLOAD_WORKERS", self.upload_workers as u64),
            ("LOG_PROCESSOR_SCALE_INTERVAL_SECS", self.scale_interval.as_secs()),
            ("LOG_PROCESSOR_MESSAGES_PER_WORKER", self.messages_per_worker),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid {
                name: *name,
                message: "must be greater than 0".to_string(),
            });
        }

        if self.max_buffered_bytes < self.max_buffer_bytes {
            return Err(ConfigError::Invalid {
                name: "LOG_PROCESSOR_MAX_BUFFERED_BYTES",
                message: format!(
                    "{} is smaller than the per-buffer ceiling {}",
                    self.max_buffered_bytes, self.max_buffer_bytes
                ),
            });
        }

        if self.json_log_types.is_empty() {
            return Err(ConfigError::Invalid {
                name: "LOG_PROCESSOR_JSON_LOG_TYPES",
                message: "at least one log type is required".to_string(),
            });
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid {
                name: "LOG_PROCESSOR_LOG_LEVEL",
                message: format!(
                    "'{}', must be one of: trace, debug, info, warn, error",
                    self.log_level
                ),
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn destination(&self) -> S3DestinationConfig {
        S3DestinationConfig {
            bucket: self.bucket.clone(),
            max_buffer_bytes: self.max_buffer_bytes,
            max_buffered_bytes: self.max_buffered_bytes,
            max_buffer_age: self.max_buffer_age,
            upload_workers: self.upload_workers,
        }
    }

    #[must_use]
    pub fn stream(&self) -> StreamConfig {
        StreamConfig {
            invocation_timeout: self.invocation_timeout,
            processing_fraction: self.processing_fraction,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn scaling(&self) -> ScalingConfig {
        ScalingConfig {
            interval: self.scale_interval,
            messages_per_worker: self.messages_per_worker,
            max_workers_per_tick: self.max_scale_per_tick,
        }
    }
}
