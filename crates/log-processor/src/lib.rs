// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log ingestion core.
//!
//! Raw log text arrives as queue messages pointing at objects. Each line is
//! classified against the registered log types, parsed into events and
//! written, gzip compressed and partitioned by hour and log type, to an
//! object store. Every written object is announced with a notification.
//!
//! Data flow of one invocation:
//!
//! [`stream::stream_events`] -> [`processor::process`] ->
//! [`classification::Classifier`] -> [`destinations::s3::S3Destination`]
//!
//! [`scaling::Scaler`] runs next to it and starts more invocations when
//! the queue backs up.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aws;
pub mod classification;
pub mod config;
pub mod destinations;
pub mod errors;
pub mod metrics;
pub mod parsers;
pub mod processor;
pub mod scaling;
pub mod stream;
