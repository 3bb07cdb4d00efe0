//! Regular expression extraction for REST and Generic sources
//!
//! Each configured metric owns one compiled pattern. The page is split into
//! lines and, per metric, the first line on which the pattern's first capture
//! group participates wins. A metric that cannot be found or parsed does not
//! stop the others: its failure is recorded and its output slot left empty.

use std::time::SystemTime;

use regex::Regex;
use tracing::trace;

use crate::{
    config::Descriptor,
    metric::{Sample, Value, ValueKind},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// A failure to extract one metric from one page
pub enum ExtractionError {
    /// No line matched the metric's pattern
    #[error("No match found for regexp: {pattern} for metric '{metric}'")]
    NoMatch {
        /// Metric name
        metric: String,
        /// Pattern as configured
        pattern: String,
    },
    /// The captured text is not a number of the declared kind
    #[error("Failed to parse {text:?} as {kind} for metric '{metric}'")]
    ValueParse {
        /// Metric name
        metric: String,
        /// Captured text, trimmed
        text: String,
        /// Declared kind
        kind: ValueKind,
    },
}

/// Output of [`extract`]
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// One slot per configured metric, in configuration order. A slot is `None`
    /// exactly when its metric has an entry in `errors`.
    pub samples: Vec<Option<Sample>>,
    /// Per-metric failures, in configuration order
    pub errors: Vec<ExtractionError>,
}

/// Extract every configured metric from `text`.
///
/// All produced samples share `timestamp`.
#[must_use]
pub fn extract(text: &str, metrics: &[Descriptor], timestamp: SystemTime) -> Extraction {
    let mut samples = Vec::with_capacity(metrics.len());
    let mut errors = Vec::new();

    for descriptor in metrics {
        match extract_one(text, descriptor) {
            Ok(value) => {
                trace!("{name} = {value:?}", name = descriptor.name);
                samples.push(Some(Sample {
                    name: descriptor.name.clone(),
                    metric_type: descriptor.metric_type,
                    timestamp,
                    value,
                    label: None,
                }));
            }
            Err(e) => {
                trace!("{e}");
                samples.push(None);
                errors.push(e);
            }
        }
    }

    Extraction { samples, errors }
}

fn extract_one(text: &str, descriptor: &Descriptor) -> Result<Value, ExtractionError> {
    let captured =
        first_capture(&descriptor.pattern, text).ok_or_else(|| ExtractionError::NoMatch {
            metric: descriptor.name.clone(),
            pattern: descriptor.pattern.as_str().to_string(),
        })?;
    let captured = captured.trim();

    parse_value(captured, descriptor.value_kind).ok_or_else(|| ExtractionError::ValueParse {
        metric: descriptor.name.clone(),
        text: captured.to_string(),
        kind: descriptor.value_kind,
    })
}

fn first_capture<'a>(pattern: &Regex, text: &'a str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        pattern
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    })
}

fn parse_value(text: &str, kind: ValueKind) -> Option<Value> {
    match kind {
        ValueKind::Integer => text.parse::<i64>().ok().map(Value::Int),
        ValueKind::Float => text.parse::<f64>().ok().map(Value::Float),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::metric::MetricType;

    const NGINX_STATUS: &str = "Active connections: 3\n\
                                server accepts handled requests\n\
                                5 5 32\n\
                                Reading: 0 Writing: 1 Waiting: 2\n";

    fn descriptor(name: &str, pattern: &str, value_kind: ValueKind) -> Descriptor {
        Descriptor {
            name: name.to_string(),
            metric_type: MetricType::Gauge,
            value_kind,
            pattern: Regex::new(pattern).unwrap(),
            polling_frequency: Duration::from_secs(10),
        }
    }

    fn nginx() -> Vec<Descriptor> {
        vec![
            descriptor(
                "activeConnections",
                "Active connections: ([0-9]+)",
                ValueKind::Integer,
            ),
            descriptor("reading", "Reading: ([0-9]+) .*", ValueKind::Integer),
            descriptor("writing", ".*Writing: ([0-9]+).*", ValueKind::Integer),
            descriptor("waiting", ".*Waiting: ([0-9]+)", ValueKind::Integer),
        ]
    }

    fn value(slot: &Option<Sample>) -> i64 {
        slot.as_ref()
            .and_then(|s| s.value.as_i64())
            .expect("integer sample")
    }

    #[test]
    fn nginx_connections_add_up() {
        let now = SystemTime::now();
        let out = extract(NGINX_STATUS, &nginx(), now);

        assert!(out.errors.is_empty());
        assert_eq!(out.samples.len(), 4);
        assert_eq!(
            value(&out.samples[0]),
            value(&out.samples[1]) + value(&out.samples[2]) + value(&out.samples[3])
        );
        assert!(out.samples.iter().flatten().all(|s| s.timestamp == now));
    }

    #[test]
    fn first_matching_line_wins() {
        let text = "queue: 4\nqueue: 9\n";
        let out = extract(
            text,
            &[descriptor("queue", "queue: ([0-9]+)", ValueKind::Integer)],
            SystemTime::now(),
        );
        assert_eq!(value(&out.samples[0]), 4);
    }

    #[test]
    fn optional_group_must_participate() {
        // The first line matches but the group does not take part.
        let text = "load\nload 0.75\n";
        let out = extract(
            text,
            &[descriptor("load", "^load( [0-9.]+)?$", ValueKind::Float)],
            SystemTime::now(),
        );
        assert_eq!(
            out.samples[0].as_ref().map(|s| s.value),
            Some(Value::Float(0.75))
        );
    }

    #[test]
    fn missing_metric_is_isolated() {
        let mut metrics = nginx();
        metrics.insert(
            1,
            descriptor("handled", "Handled: ([0-9]+)", ValueKind::Integer),
        );
        let out = extract(NGINX_STATUS, &metrics, SystemTime::now());

        assert_eq!(out.samples.len(), 5);
        assert!(out.samples[1].is_none());
        assert_eq!(out.samples[2].as_ref().unwrap().name, "reading");
        assert_eq!(
            out.errors,
            vec![ExtractionError::NoMatch {
                metric: "handled".to_string(),
                pattern: "Handled: ([0-9]+)".to_string(),
            }]
        );
    }

    #[test]
    fn unparsable_value_is_isolated() {
        let text = "temperature: warm\nhumidity: 0.4\n";
        let metrics = [
            descriptor("temperature", "temperature: (.+)", ValueKind::Float),
            descriptor("humidity", "humidity: (.+)", ValueKind::Float),
        ];
        let out = extract(text, &metrics, SystemTime::now());

        assert!(out.samples[0].is_none());
        assert_eq!(
            out.samples[1].as_ref().map(|s| s.value),
            Some(Value::Float(0.4))
        );
        assert_eq!(
            out.errors,
            vec![ExtractionError::ValueParse {
                metric: "temperature".to_string(),
                text: "warm".to_string(),
                kind: ValueKind::Float,
            }]
        );
    }

    #[test]
    fn captured_text_is_trimmed() {
        let out = extract(
            "uptime:   42  \n",
            &[descriptor("uptime", "uptime:(.*)", ValueKind::Integer)],
            SystemTime::now(),
        );
        assert_eq!(value(&out.samples[0]), 42);
    }

    #[test]
    fn integer_kind_rejects_fractions() {
        let out = extract(
            "ratio: 1.5\n",
            &[descriptor("ratio", "ratio: (.*)", ValueKind::Integer)],
            SystemTime::now(),
        );
        assert!(out.samples[0].is_none());
        assert_eq!(out.errors.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_output_is_index_aligned(
            values in prop::collection::vec(prop::option::of(any::<i64>()), 1..16),
        ) {
            let text: String = values
                .iter()
                .enumerate()
                .filter_map(|(i, v)| v.map(|v| format!("metric_{i}: {v}\n")))
                .collect();
            let metrics: Vec<_> = (0..values.len())
                .map(|i| {
                    descriptor(
                        &format!("metric_{i}"),
                        &format!("^metric_{i}: (-?[0-9]+)$"),
                        ValueKind::Integer,
                    )
                })
                .collect();

            let out = extract(&text, &metrics, SystemTime::now());

            prop_assert_eq!(out.samples.len(), values.len());
            for (i, (slot, expected)) in out.samples.iter().zip(&values).enumerate() {
                match (slot, expected) {
                    (Some(sample), Some(v)) => {
                        prop_assert_eq!(&sample.name, &format!("metric_{i}"));
                        prop_assert_eq!(sample.value, Value::Int(*v));
                    }
                    (None, None) => {}
                    _ => prop_assert!(false, "slot {} misaligned", i),
                }
            }
            let missing = values.iter().filter(|v| v.is_none()).count();
            prop_assert_eq!(out.errors.len(), missing);
        }
    }
}
