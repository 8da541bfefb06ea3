// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line classification.
//!
//! A [`Classifier`] finds the parser that understands a stream and then
//! sticks with it:
//!
//! ```text
//!   line ──> pinned parser? ──yes──> parse with pinned parser
//!                 │
//!                 no
//!                 v
//!        try parsers in registry order
//!                 │
//!        first success pins the parser
//! ```
//!
//! One classifier serves one homogeneous stream. Streams that multiplex
//! several sources go through [`sources::SourceClassifier`], which keeps a
//! classifier per source.

pub mod sources;

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::ops::AddAssign;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::error;

use crate::errors::{ClassifyError, ParseError};
use crate::parsers::{NamedParser, ParsedEvent};

/// Outcome of classifying one line.
#[derive(Debug, Default)]
pub struct ClassifierResult {
    pub events: Vec<ParsedEvent>,
    /// Log type of the parser that accepted the line, `None` when nothing did.
    pub log_type: Option<String>,
    /// The line as handed to the parsers (trimmed).
    pub line: String,
}

impl ClassifierResult {
    #[must_use]
    pub fn is_classified(&self) -> bool {
        self.log_type.is_some()
    }
}

/// Counters of one classifier. They only ever grow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassifierStats {
    pub classify_time_microseconds: u64,
    pub bytes_processed_count: u64,
    pub log_line_count: u64,
    pub event_count: u64,
    pub successfully_classified_count: u64,
    pub classification_failure_count: u64,
}

impl AddAssign for ClassifierStats {
    fn add_assign(&mut self, other: Self) {
        self.classify_time_microseconds += other.classify_time_microseconds;
        self.bytes_processed_count += other.bytes_processed_count;
        self.log_line_count += other.log_line_count;
        self.event_count += other.event_count;
        self.successfully_classified_count += other.successfully_classified_count;
        self.classification_failure_count += other.classification_failure_count;
    }
}

impl ClassifierStats {
    /// What was counted after `earlier` was taken.
    #[must_use]
    pub fn since(&self, earlier: &ClassifierStats) -> ClassifierStats {
        ClassifierStats {
            classify_time_microseconds: self
                .classify_time_microseconds
                .saturating_sub(earlier.classify_time_microseconds),
            bytes_processed_count: self
                .bytes_processed_count
                .saturating_sub(earlier.bytes_processed_count),
            log_line_count: self.log_line_count.saturating_sub(earlier.log_line_count),
            event_count: self.event_count.saturating_sub(earlier.event_count),
            successfully_classified_count: self
                .successfully_classified_count
                .saturating_sub(earlier.successfully_classified_count),
            classification_failure_count: self
                .classification_failure_count
                .saturating_sub(earlier.classification_failure_count),
        }
    }
}

/// Counters of the parser for one log type.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ParserStats {
    pub log_type: String,
    pub parser_time_microseconds: u64,
    pub bytes_processed_count: u64,
    pub log_line_count: u64,
    pub event_count: u64,
    /// Sum over events of `parse_time - event_time`.
    pub combined_latency_microseconds: u64,
}

impl ParserStats {
    fn merge(&mut self, other: &ParserStats) {
        self.parser_time_microseconds += other.parser_time_microseconds;
        self.bytes_processed_count += other.bytes_processed_count;
        self.log_line_count += other.log_line_count;
        self.event_count += other.event_count;
        self.combined_latency_microseconds += other.combined_latency_microseconds;
    }
}

/// Adds every entry of `from` into `into`.
pub fn merge_parser_stats(
    into: &mut HashMap<String, ParserStats>,
    from: &HashMap<String, ParserStats>,
) {
    for (log_type, stats) in from {
        into.entry(log_type.clone())
            .or_insert_with(|| ParserStats {
                log_type: log_type.clone(),
                ..Default::default()
            })
            .merge(stats);
    }
}

/// Per log type, what was counted after `earlier` was taken. Log types
/// that saw no new lines are left out.
#[must_use]
pub fn parser_stats_since(
    now: &HashMap<String, ParserStats>,
    earlier: &HashMap<String, ParserStats>,
) -> HashMap<String, ParserStats> {
    now.iter()
        .filter_map(|(log_type, stats)| {
            let delta = match earlier.get(log_type) {
                Some(before) => ParserStats {
                    log_type: log_type.clone(),
                    parser_time_microseconds: stats
                        .parser_time_microseconds
                        .saturating_sub(before.parser_time_microseconds),
                    bytes_processed_count: stats
                        .bytes_processed_count
                        .saturating_sub(before.bytes_processed_count),
                    log_line_count: stats.log_line_count.saturating_sub(before.log_line_count),
                    event_count: stats.event_count.saturating_sub(before.event_count),
                    combined_latency_microseconds: stats
                        .combined_latency_microseconds
                        .saturating_sub(before.combined_latency_microseconds),
                },
                None => stats.clone(),
            };
            (delta.log_line_count > 0).then(|| (log_type.clone(), delta))
        })
        .collect()
}

/// Anything that turns raw lines into events for a processor.
#[async_trait]
pub trait LineClassifier: Send {
    async fn classify(&mut self, line: &str) -> Result<ClassifierResult, ClassifyError>;
    fn stats(&self) -> ClassifierStats;
    fn parser_stats(&self) -> HashMap<String, ParserStats>;
}

/// Classifier for a single homogeneous stream.
pub struct Classifier {
    parsers: Vec<NamedParser>,
    pinned: Option<usize>,
    source: Option<(String, String)>,
    stats: ClassifierStats,
    parser_stats: HashMap<String, ParserStats>,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("parsers", &self.parsers)
            .field("pinned", &self.pinned_log_type())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Classifier {
    #[must_use]
    pub fn new(parsers: Vec<NamedParser>) -> Self {
        Classifier {
            parsers,
            pinned: None,
            source: None,
            stats: ClassifierStats::default(),
            parser_stats: HashMap::new(),
        }
    }

    /// Tags every event produced by this classifier with a source.
    #[must_use]
    pub fn with_source(mut self, source_id: &str, source_label: &str) -> Self {
        self.source = Some((source_id.to_string(), source_label.to_string()));
        self
    }

    /// Log type of the parser this classifier settled on, if any.
    #[must_use]
    pub fn pinned_log_type(&self) -> Option<&str> {
        self.pinned.map(|i| self.parsers[i].log_type.as_str())
    }

    /// Classifies one line.
    ///
    /// A zero-length line is ignored entirely. A whitespace-only line is
    /// counted as a line but never reaches the parsers.
    pub fn classify_line(&mut self, line: &str) -> ClassifierResult {
        if line.is_empty() {
            return ClassifierResult::default();
        }
        let start = Instant::now();
        self.stats.log_line_count += 1;
        self.stats.bytes_processed_count += line.len() as u64;

        let trimmed = line.trim();
        let mut result = ClassifierResult {
            line: trimmed.to_string(),
            ..Default::default()
        };
        if trimmed.is_empty() {
            self.stats.classify_time_microseconds += elapsed_micros(start);
            return result;
        }

        let found = match self.pinned {
            Some(index) => self.try_parser(index, trimmed).map(|events| (index, events)),
            None => (0..self.parsers.len())
                .find_map(|index| self.try_parser(index, trimmed).map(|events| (index, events))),
        };

        match found {
            Some((index, events)) => {
                self.pinned = Some(index);
                self.stats.successfully_classified_count += 1;
                self.stats.event_count += events.len() as u64;
                result.log_type = Some(self.parsers[index].log_type.clone());
                result.events = match &self.source {
                    Some((id, label)) => events
                        .into_iter()
                        .map(|event| event.with_source(id, label))
                        .collect(),
                    None => events,
                };
            }
            None => {
                self.stats.classification_failure_count += 1;
            }
        }
        self.stats.classify_time_microseconds += elapsed_micros(start);
        result
    }

    /// Runs one parser, turning a panic into a failed parse.
    fn try_parser(&mut self, index: usize, line: &str) -> Option<Vec<ParsedEvent>> {
        let start = Instant::now();
        let named = &mut self.parsers[index];
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| named.parser.parse_log(line)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(
                    log_type = %named.log_type,
                    backtrace = %Backtrace::force_capture(),
                    "parser panicked: {message}"
                );
                Err(ParseError::Panicked(message))
            });
        let events = outcome.ok()?;
        let elapsed = elapsed_micros(start);

        let stats = self
            .parser_stats
            .entry(named.log_type.clone())
            .or_insert_with(|| ParserStats {
                log_type: named.log_type.clone(),
                ..Default::default()
            });
        stats.parser_time_microseconds += elapsed;
        stats.bytes_processed_count += line.len() as u64;
        stats.log_line_count += 1;
        stats.event_count += events.len() as u64;
        stats.combined_latency_microseconds += events
            .iter()
            .map(|e| {
                (e.parse_time - e.event_time)
                    .num_microseconds()
                    .unwrap_or_default()
                    .max(0) as u64
            })
            .sum::<u64>();
        Some(events)
    }
}

#[async_trait]
impl LineClassifier for Classifier {
    async fn classify(&mut self, line: &str) -> Result<ClassifierResult, ClassifyError> {
        Ok(self.classify_line(line))
    }

    fn stats(&self) -> ClassifierStats {
        self.stats
    }

    fn parser_stats(&self) -> HashMap<String, ParserStats> {
        self.parser_stats.clone()
    }
}

fn elapsed_micros(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
