// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic parser for newline-delimited JSON objects.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::errors::ParseError;
use crate::parsers::{LogParser, ParsedEvent, ParserFactory};

/// Epoch values above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct JsonParserConfig {
    pub log_type: String,
    /// Field holding the event time; RFC 3339 strings or epoch numbers.
    #[serde(default)]
    pub timestamp_field: Option<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl JsonParserConfig {
    #[must_use]
    pub fn new(log_type: &str) -> Self {
        JsonParserConfig {
            log_type: log_type.to_string(),
            timestamp_field: None,
            required_fields: Vec::new(),
        }
    }

    /// Wraps the config in a factory suitable for [`crate::parsers::Registry`].
    #[must_use]
    pub fn into_factory(self) -> Arc<dyn ParserFactory> {
        Arc::new(move || -> Result<Box<dyn LogParser>, ParseError> {
            Ok(Box::new(JsonLogParser::new(self.clone())))
        })
    }
}

#[derive(Debug, Clone)]
pub struct JsonLogParser {
    config: JsonParserConfig,
}

impl JsonLogParser {
    #[must_use]
    pub fn new(config: JsonParserConfig) -> Self {
        JsonLogParser { config }
    }

    fn event_time(&self, event: &Value) -> Result<Option<DateTime<Utc>>, ParseError> {
        let Some(field) = &self.config.timestamp_field else {
            return Ok(None);
        };
        match event.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(ts)) => DateTime::parse_from_rfc3339(ts)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(|e| ParseError::InvalidLine(format!("bad timestamp '{ts}': {e}"))),
            Some(Value::Number(n)) => {
                let Some(epoch) = n.as_i64() else {
                    return Err(ParseError::InvalidLine(format!("bad timestamp {n}")));
                };
                let ts = if epoch > EPOCH_MILLIS_THRESHOLD {
                    Utc.timestamp_millis_opt(epoch).single()
                } else {
                    Utc.timestamp_opt(epoch, 0).single()
                };
                ts.map(Some)
                    .ok_or_else(|| ParseError::InvalidLine(format!("bad timestamp {epoch}")))
            }
            Some(other) => Err(ParseError::InvalidLine(format!(
                "bad timestamp {other}"
            ))),
        }
    }
}

impl LogParser for JsonLogParser {
    fn parse_log(&mut self, line: &str) -> Result<Vec<ParsedEvent>, ParseError> {
        let event: Value =
            serde_json::from_str(line).map_err(|e| ParseError::InvalidLine(e.to_string()))?;
        if !event.is_object() {
            return Err(ParseError::InvalidLine("not a JSON object".to_string()));
        }
        if let Some(missing) = self
            .config
            .required_fields
            .iter()
            .find(|field| event.get(field.as_str()).is_none())
        {
            return Err(ParseError::MissingField(missing.clone()));
        }
        let event_time = self.event_time(&event)?;
        Ok(vec![ParsedEvent::new(
            &self.config.log_type,
            event_time,
            event,
        )])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parser() -> JsonLogParser {
        JsonLogParser::new(JsonParserConfig {
            log_type: "Custom.Audit".to_string(),
            timestamp_field: Some("ts".to_string()),
            required_fields: vec!["actor".to_string()],
        })
    }

    #[test]
    fn test_parses_object_with_rfc3339_time() {
        let events = parser()
            .parse_log(r#"{"actor":"alice","ts":"2024-03-09T17:42:11Z"}"#)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].log_type, "Custom.Audit");
        assert_eq!(
            events[0].event_time,
            Utc.with_ymd_and_hms(2024, 3, 9, 17, 42, 11).unwrap()
        );
    }

    #[test]
    fn test_parses_epoch_seconds_and_millis() {
        let mut parser = parser();
        let seconds = parser.parse_log(r#"{"actor":"a","ts":1710006131}"#).unwrap();
        let millis = parser
            .parse_log(r#"{"actor":"a","ts":1710006131000}"#)
            .unwrap();
        assert_eq!(seconds[0].event_time, millis[0].event_time);
    }

    #[test]
    fn test_rejects_missing_required_field() {
        let err = parser().parse_log(r#"{"ts":1710006131}"#).unwrap_err();
        assert_eq!(err, ParseError::MissingField("actor".to_string()));
    }

    #[test]
    fn test_rejects_non_json_and_non_objects() {
        let mut parser = parser();
        assert!(parser.parse_log("plain text").is_err());
        assert!(parser.parse_log("[1,2]").is_err());
        assert!(parser.parse_log(r#"{"actor":"a","ts":true}"#).is_err());
    }

    #[test]
    fn test_factory_builds_parsers() {
        let factory = JsonParserConfig::new("Custom.JSON").into_factory();
        let mut parser = factory.new_parser().unwrap();
        let events = parser.parse_log(r#"{"k":"v"}"#).unwrap();
        assert_eq!(events[0].log_type, "Custom.JSON");
    }
}
