//! Self telemetry
//!
//! Counters about the agent's own polling, emitted through the `metrics`
//! facade. Nothing is recorded unless the embedding program installs a
//! recorder.

use metrics::counter;

/// Record a poll that fetched and parsed its source.
pub(crate) fn poll_completed(collector: &str, samples: usize, extraction_errors: usize) {
    let labels = [("collector", collector.to_string())];
    counter!("siphon_polls_total", &labels).increment(1);
    counter!("siphon_samples_collected_total", &labels)
        .increment(u64::try_from(samples).unwrap_or(u64::MAX));
    if extraction_errors > 0 {
        counter!("siphon_extraction_errors_total", &labels)
            .increment(u64::try_from(extraction_errors).unwrap_or(u64::MAX));
    }
}

/// Record a poll that produced no samples at all.
pub(crate) fn poll_failed(collector: &str) {
    let labels = [("collector", collector.to_string())];
    counter!("siphon_polls_total", &labels).increment(1);
    counter!("siphon_poll_failures_total", &labels).increment(1);
}
