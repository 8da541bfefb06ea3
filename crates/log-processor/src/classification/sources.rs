// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Classification of streams that multiplex many sources.
//!
//! Each line is an envelope `{"sourceId": ..., "payload": ...}`. The
//! payload is classified by a classifier built for that source and cached
//! for the rest of the stream.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classification::{
    merge_parser_stats, Classifier, ClassifierResult, ClassifierStats, LineClassifier,
    ParserStats,
};
use crate::errors::{ClassifyError, SourceError};
use crate::parsers::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEnvelope {
    pub source_id: String,
    pub payload: String,
}

/// Configuration of one log source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub id: String,
    pub label: String,
    /// Log types this source may emit, in any order.
    pub log_types: Vec<String>,
}

#[async_trait]
pub trait SourceLoader: Send + Sync {
    async fn load_source(&self, source_id: &str) -> Result<SourceConfig, SourceError>;
}

/// Loader backed by a fixed set of sources.
#[derive(Debug, Default, Clone)]
pub struct StaticSourceLoader {
    sources: HashMap<String, SourceConfig>,
}

impl StaticSourceLoader {
    #[must_use]
    pub fn new(sources: Vec<SourceConfig>) -> Self {
        StaticSourceLoader {
            sources: sources.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    /// Reads a JSON array of source configurations.
    pub async fn from_file(path: &Path) -> Result<Self, SourceError> {
        let load_error = |message: String| SourceError::Load {
            source_id: path.display().to_string(),
            message,
        };
        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| load_error(e.to_string()))?;
        let sources: Vec<SourceConfig> =
            serde_json::from_slice(&contents).map_err(|e| load_error(e.to_string()))?;
        debug!(path = %path.display(), count = sources.len(), "loaded source configurations");
        Ok(Self::new(sources))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl SourceLoader for StaticSourceLoader {
    async fn load_source(&self, source_id: &str) -> Result<SourceConfig, SourceError> {
        self.sources
            .get(source_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(source_id.to_string()))
    }
}

/// Classifier that resolves a child classifier per source.
///
/// A failed source lookup is reported for that line only and retried on
/// the next line from the same source.
pub struct SourceClassifier {
    registry: Arc<Registry>,
    loader: Arc<dyn SourceLoader>,
    cache: HashMap<String, Classifier>,
    stats: ClassifierStats,
}

impl SourceClassifier {
    #[must_use]
    pub fn new(registry: Arc<Registry>, loader: Arc<dyn SourceLoader>) -> Self {
        SourceClassifier {
            registry,
            loader,
            cache: HashMap::new(),
            stats: ClassifierStats::default(),
        }
    }

    /// Number of sources with a built classifier.
    #[must_use]
    pub fn cached_sources(&self) -> usize {
        self.cache.len()
    }

    async fn classifier(&mut self, source_id: &str) -> Result<&mut Classifier, ClassifyError> {
        if !self.cache.contains_key(source_id) {
            let config = self.loader.load_source(source_id).await?;
            let parsers = self.registry.parsers_for(&config.log_types)?;
            debug!(source_id, label = %config.label, "built classifier for source");
            self.cache.insert(
                source_id.to_string(),
                Classifier::new(parsers).with_source(&config.id, &config.label),
            );
        }
        self.cache
            .get_mut(source_id)
            .ok_or_else(|| SourceError::NotFound(source_id.to_string()).into())
    }

    fn record_failure(&mut self, raw: &str) {
        self.stats.log_line_count += 1;
        self.stats.bytes_processed_count += raw.len() as u64;
        self.stats.classification_failure_count += 1;
    }
}

#[async_trait]
impl LineClassifier for SourceClassifier {
    async fn classify(&mut self, raw: &str) -> Result<ClassifierResult, ClassifyError> {
        if raw.trim().is_empty() {
            return Ok(ClassifierResult::default());
        }
        let envelope: SourceEnvelope = match serde_json::from_str(raw.trim()) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.record_failure(raw);
                return Err(e.into());
            }
        };
        let classifier = match self.classifier(&envelope.source_id).await {
            Ok(classifier) => classifier,
            Err(e) => {
                warn!(source_id = %envelope.source_id, "failed to resolve source: {e}");
                self.record_failure(raw);
                return Err(e);
            }
        };

        Ok(classifier.classify_line(&envelope.payload))
    }

    fn stats(&self) -> ClassifierStats {
        let mut stats = self.stats;
        for classifier in self.cache.values() {
            stats += classifier.stats();
        }
        stats
    }

    fn parser_stats(&self) -> HashMap<String, ParserStats> {
        let mut stats = HashMap::new();
        for classifier in self.cache.values() {
            merge_parser_stats(&mut stats, &classifier.parser_stats());
        }
        stats
    }
}
