// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Operational counters of processed streams.
//!
//! Counters go through the `metrics` facade. [`init_metrics`] installs the
//! Prometheus recorder once at startup; without it every counter is a no-op.

use std::collections::HashMap;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::classification::{ClassifierStats, ParserStats};

/// Installs the Prometheus recorder for the whole process.
///
/// Fails if a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!("log_processor.streams", "Data streams read to the end or failed");
    describe_counter!(
        "log_processor.bytes_processed",
        Unit::Bytes,
        "Bytes of log lines handed to classifiers"
    );
    describe_counter!("log_processor.lines", "Log lines read");
    describe_counter!("log_processor.events", "Events produced by parsers");
    describe_counter!(
        "log_processor.classification_failures",
        "Lines no parser accepted"
    );
    describe_histogram!(
        "log_processor.classify_time_seconds",
        Unit::Seconds,
        "Time spent classifying one stream"
    );
    describe_counter!("log_processor.objects_written", "Objects uploaded by the destination");
    describe_counter!(
        "log_processor.scale_out_invocations",
        "Extra workers started by the scaler"
    );
}

/// Emits the counters of one finished stream.
pub fn record_stream(
    location: &str,
    stats: &ClassifierStats,
    parser_stats: &HashMap<String, ParserStats>,
    succeeded: bool,
) {
    counter!("log_processor.streams", "outcome" => outcome(succeeded)).increment(1);
    counter!("log_processor.bytes_processed").increment(stats.bytes_processed_count);
    counter!("log_processor.lines").increment(stats.log_line_count);
    counter!("log_processor.events").increment(stats.event_count);
    counter!("log_processor.classification_failures")
        .increment(stats.classification_failure_count);
    histogram!("log_processor.classify_time_seconds")
        .record(stats.classify_time_microseconds as f64 / 1_000_000.0);

    info!(
        location,
        succeeded,
        bytes = stats.bytes_processed_count,
        lines = stats.log_line_count,
        events = stats.event_count,
        classified = stats.successfully_classified_count,
        failures = stats.classification_failure_count,
        classify_time_us = stats.classify_time_microseconds,
        "processed stream"
    );

    for (log_type, parser) in parser_stats {
        counter!("log_processor.parser.bytes_processed", "log_type" => log_type.clone())
            .increment(parser.bytes_processed_count);
        counter!("log_processor.parser.events", "log_type" => log_type.clone())
            .increment(parser.event_count);
        counter!("log_processor.parser.combined_latency_us", "log_type" => log_type.clone())
            .increment(parser.combined_latency_microseconds);
        info!(
            location,
            log_type = %log_type,
            bytes = parser.bytes_processed_count,
            lines = parser.log_line_count,
            events = parser.event_count,
            parser_time_us = parser.parser_time_microseconds,
            combined_latency_us = parser.combined_latency_microseconds,
            "parser stats"
        );
    }
}

fn outcome(succeeded: bool) -> &'static str {
    if succeeded {
        "success"
    } else {
        "failure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_stream_counters_reach_prometheus() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let stats = ClassifierStats {
            log_line_count: 4,
            event_count: 3,
            classification_failure_count: 1,
            ..Default::default()
        };

        metrics::with_local_recorder(&recorder, || {
            record_stream("s3://bucket/key", &stats, &HashMap::new(), true);
        });

        let rendered = handle.render();
        assert!(rendered.contains("log_processor_events"), "{rendered}");
        assert!(rendered.contains("log_processor_classification_failures"));
        assert!(rendered.contains(r#"outcome="success""#));
    }

    #[test]
    #[traced_test]
    fn test_record_stream_logs_per_type_stats() {
        let stats = ClassifierStats {
            log_line_count: 3,
            event_count: 2,
            ..Default::default()
        };
        let mut parser_stats = HashMap::new();
        parser_stats.insert(
            "Custom.JSON".to_string(),
            ParserStats {
                log_type: "Custom.JSON".to_string(),
                event_count: 2,
                ..Default::default()
            },
        );

        record_stream("s3://bucket/key", &stats, &parser_stats, false);

        assert!(logs_contain("processed stream"));
        assert!(logs_contain("succeeded=false"));
        assert!(logs_contain("log_type=Custom.JSON"));
    }
}
