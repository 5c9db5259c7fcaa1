//! chainpipe metrics definitions.
//!
//! All metrics use OpenTelemetry conventions.

use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};

/// Central metrics handle shared by workers and publisher lanes.
#[derive(Clone)]
pub struct PipelineMetrics {
    pub records_received: Counter<u64>,
    pub events_published: Counter<u64>,
    pub decode_errors: Counter<u64>,
    pub duplicates_skipped: Counter<u64>,
    pub cache_errors: Counter<u64>,
    pub publish_retries: Counter<u64>,
    pub worker_restarts: Counter<u64>,
    pub publish_latency_ms: Histogram<f64>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::global()
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics").finish_non_exhaustive()
    }
}

impl PipelineMetrics {
    /// Instruments from the global `chainpipe` meter.
    pub fn global() -> Self {
        Self::new(&global::meter("chainpipe"))
    }

    pub fn new(meter: &Meter) -> Self {
        Self {
            records_received: meter
                .u64_counter("chainpipe.records_received")
                .with_description("Raw records received from source connections")
                .build(),
            events_published: meter
                .u64_counter("chainpipe.events_published")
                .with_description("Events acknowledged by the bus")
                .build(),
            decode_errors: meter
                .u64_counter("chainpipe.decode_errors")
                .with_description("Raw records that failed to decode")
                .build(),
            duplicates_skipped: meter
                .u64_counter("chainpipe.duplicates_skipped")
                .with_description("Events suppressed by the dedup cache")
                .build(),
            cache_errors: meter
                .u64_counter("chainpipe.cache_errors")
                .with_description("Dedup cache operations downgraded to a miss")
                .build(),
            publish_retries: meter
                .u64_counter("chainpipe.publish_retries")
                .with_description("Bus sends retried after a transient failure")
                .build(),
            worker_restarts: meter
                .u64_counter("chainpipe.worker_restarts")
                .with_description("Worker reconnects and crash restarts")
                .build(),
            publish_latency_ms: meter
                .f64_histogram("chainpipe.publish_latency_ms")
                .with_description("Time from enqueue to bus acknowledgement in milliseconds")
                .build(),
        }
    }

    pub fn record_received(&self, source_id: &str, chain_type: &str) {
        self.records_received.add(1, &source_attrs(source_id, chain_type));
    }

    pub fn record_published(&self, source_id: &str, chain_type: &str) {
        self.events_published.add(1, &source_attrs(source_id, chain_type));
    }

    pub fn record_decode_error(&self, chain_type: &str, error_type: &str) {
        self.decode_errors.add(
            1,
            &[
                KeyValue::new("chain", chain_type.to_string()),
                KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }

    pub fn record_duplicate(&self, source_id: &str) {
        self.duplicates_skipped
            .add(1, &[KeyValue::new("source", source_id.to_string())]);
    }

    pub fn record_cache_errors(&self, count: u64) {
        if count > 0 {
            self.cache_errors.add(count, &[]);
        }
    }

    pub fn record_publish_retry(&self, source_id: &str) {
        self.publish_retries
            .add(1, &[KeyValue::new("source", source_id.to_string())]);
    }

    pub fn record_restart(&self, source_id: &str, reason: &'static str) {
        self.worker_restarts.add(
            1,
            &[
                KeyValue::new("source", source_id.to_string()),
                KeyValue::new("reason", reason),
            ],
        );
    }

    pub fn record_publish_latency(&self, ms: f64, source_id: &str) {
        self.publish_latency_ms
            .record(ms, &[KeyValue::new("source", source_id.to_string())]);
    }
}

fn source_attrs(source_id: &str, chain_type: &str) -> [KeyValue; 2] {
    [
        KeyValue::new("source", source_id.to_string()),
        KeyValue::new("chain", chain_type.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_meter_accepts_recordings() {
        let m = PipelineMetrics::global();
        m.record_received("chainA-main", "evm");
        m.record_published("chainA-main", "evm");
        m.record_decode_error("evm", "decode_failed");
        m.record_duplicate("chainA-main");
        m.record_cache_errors(0);
        m.record_cache_errors(3);
        m.record_publish_retry("chainA-main");
        m.record_restart("chainA-main", "crash");
        m.record_publish_latency(1.5, "chainA-main");
    }
}
