// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsed events and their row identifiers.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::errors::SerializeError;

/// Truncates a timestamp to the start of its UTC hour.
#[must_use]
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::hours(1)).unwrap_or(ts)
}

/// Unique, lexically sortable row identifier.
///
/// Layout: `<yyyymmddhh>.<log type>.<random>`, so ids of one hour and type
/// sort together and can be range-scanned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(String);

impl EventId {
    #[must_use]
    pub fn new(log_type: &str, hour: DateTime<Utc>) -> Self {
        EventId(format!(
            "{}.{}.{}",
            hour.format("%Y%m%d%H"),
            log_type,
            Uuid::new_v4().simple()
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hour bucket embedded in the id.
    #[must_use]
    pub fn hour_bucket(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One structured event produced by a parser.
///
/// Immutable once handed to a destination.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub log_type: String,
    pub id: EventId,
    pub event_time: DateTime<Utc>,
    pub parse_time: DateTime<Utc>,
    pub source_id: Option<String>,
    pub source_label: Option<String>,
    pub event: Value,
}

impl ParsedEvent {
    /// Builds an event. A missing event time falls back to the parse time.
    #[must_use]
    pub fn new(log_type: &str, event_time: Option<DateTime<Utc>>, event: Value) -> Self {
        let parse_time = Utc::now();
        let event_time = event_time.unwrap_or(parse_time);
        ParsedEvent {
            log_type: log_type.to_string(),
            id: EventId::new(log_type, truncate_to_hour(event_time)),
            event_time,
            parse_time,
            source_id: None,
            source_label: None,
            event,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source_id: &str, source_label: &str) -> Self {
        self.source_id = Some(source_id.to_string());
        self.source_label = Some(source_label.to_string());
        self
    }

    /// Partition hour of this event, always derived from the event time.
    #[must_use]
    pub fn hour(&self) -> DateTime<Utc> {
        truncate_to_hour(self.event_time)
    }

    /// Serializes the event as one JSON line with the `p_*` metadata fields.
    pub fn to_json_line(&self) -> Result<Vec<u8>, SerializeError> {
        let Value::Object(fields) = &self.event else {
            return Err(SerializeError::NotAnObject(json_kind(&self.event)));
        };
        let mut row: Map<String, Value> = fields.clone();
        row.insert("p_log_type".to_string(), Value::from(self.log_type.clone()));
        row.insert("p_row_id".to_string(), Value::from(self.id.to_string()));
        row.insert(
            "p_event_time".to_string(),
            Value::from(self.event_time.to_rfc3339()),
        );
        row.insert(
            "p_parse_time".to_string(),
            Value::from(self.parse_time.to_rfc3339()),
        );
        if let Some(source_id) = &self.source_id {
            row.insert("p_source_id".to_string(), Value::from(source_id.clone()));
        }
        if let Some(source_label) = &self.source_label {
            row.insert(
                "p_source_label".to_string(),
                Value::from(source_label.clone()),
            );
        }
        let mut line = serde_json::to_vec(&row)?;
        line.push(b'\n');
        Ok(line)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
