// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parser interface and the registry of known log types.
//!
//! The classification core never looks at a concrete schema. Every log type
//! is a name plus a [`ParserFactory`]; classifiers get fresh parser
//! instances from the [`Registry`] so parser state never leaks between
//! streams.

pub mod json;
pub mod result;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{ParseError, RegistryError};
pub use result::{truncate_to_hour, EventId, ParsedEvent};

/// A parser for a single log type.
pub trait LogParser: Send {
    /// Parses one line. `Err` means the line does not belong to this type.
    fn parse_log(&mut self, line: &str) -> Result<Vec<ParsedEvent>, ParseError>;
}

/// Creates parser instances for one log type.
pub trait ParserFactory: Send + Sync {
    fn new_parser(&self) -> Result<Box<dyn LogParser>, ParseError>;
}

impl<F> ParserFactory for F
where
    F: Fn() -> Result<Box<dyn LogParser>, ParseError> + Send + Sync,
{
    fn new_parser(&self) -> Result<Box<dyn LogParser>, ParseError> {
        (self)()
    }
}

/// A parser instance tagged with the log type it serves.
pub struct NamedParser {
    pub log_type: String,
    pub parser: Box<dyn LogParser>,
}

impl fmt::Debug for NamedParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedParser")
            .field("log_type", &self.log_type)
            .finish_non_exhaustive()
    }
}

struct Entry {
    log_type: String,
    factory: Arc<dyn ParserFactory>,
}

/// Ordered registry of log types.
///
/// Built once at startup and shared by reference; registration order is the
/// order in which an unpinned classifier tries parsers.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| &e.log_type))
            .finish()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        log_type: &str,
        factory: Arc<dyn ParserFactory>,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(log_type) {
            return Err(RegistryError::Duplicate(log_type.to_string()));
        }
        self.index.insert(log_type.to_string(), self.entries.len());
        self.entries.push(Entry {
            log_type: log_type.to_string(),
            factory,
        });
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, log_type: &str) -> bool {
        self.index.contains_key(log_type)
    }

    pub fn log_types(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.log_type.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Creates one parser per registered type, in registration order.
    pub fn all_parsers(&self) -> Result<Vec<NamedParser>, RegistryError> {
        self.entries.iter().map(Self::instantiate).collect()
    }

    /// Creates parsers for `log_types`, keeping registration order.
    ///
    /// Unknown names are an error so a misconfigured source is noticed
    /// instead of silently classifying nothing.
    pub fn parsers_for<S: AsRef<str>>(
        &self,
        log_types: &[S],
    ) -> Result<Vec<NamedParser>, RegistryError> {
        let mut positions = Vec::with_capacity(log_types.len());
        for log_type in log_types {
            let log_type = log_type.as_ref();
            let Some(position) = self.index.get(log_type) else {
                return Err(RegistryError::UnknownLogType(log_type.to_string()));
            };
            positions.push(*position);
        }
        positions.sort_unstable();
        positions.dedup();
        positions
            .into_iter()
            .map(|position| Self::instantiate(&self.entries[position]))
            .collect()
    }

    fn instantiate(entry: &Entry) -> Result<NamedParser, RegistryError> {
        let parser = entry
            .factory
            .new_parser()
            .map_err(|e| RegistryError::ParserCreation {
                log_type: entry.log_type.clone(),
                message: e.to_string(),
            })?;
        Ok(NamedParser {
            log_type: entry.log_type.clone(),
            parser,
        })
    }
}
