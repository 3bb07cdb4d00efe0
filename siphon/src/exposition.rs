//! Prometheus text format parser
//!
//! Two entry points share one grammar. [`discover`] walks `# HELP` / `# TYPE`
//! comment pairs to describe what a source exposes and is best-effort: anything
//! malformed yields an empty description. [`Parser::parse_text`] reads data
//! lines up to the first blank line and is strict: a single unparsable value
//! fails the whole text.
//! <https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md>

use std::str::FromStr;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::metric::{MetricSpec, MetricType};

const HELP: &str = "# HELP";
const TYPE: &str = "# TYPE";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors that can occur while parsing exposition data lines
pub enum Error {
    /// A data line has no metric name
    #[error("line {line}: missing metric name")]
    MissingName {
        /// One-based line number
        line: usize,
    },
    /// A data line has a name but no value
    #[error("line {line}: missing value for metric {name}")]
    MissingValue {
        /// One-based line number
        line: usize,
        /// Metric name
        name: String,
    },
    /// A label block is opened but never closed
    #[error("line {line}: unclosed label block for metric {name}")]
    UnclosedLabels {
        /// One-based line number
        line: usize,
        /// Metric name
        name: String,
    },
    /// The value is not a float
    #[error("line {line}: invalid value {value:?} for metric {name}")]
    InvalidValue {
        /// One-based line number
        line: usize,
        /// Metric name
        name: String,
        /// Offending text
        value: String,
    },
    /// The optional timestamp is not an integer
    #[error("line {line}: invalid timestamp {timestamp:?} for metric {name}")]
    InvalidTimestamp {
        /// One-based line number
        line: usize,
        /// Metric name
        name: String,
        /// Offending text
        timestamp: String,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
enum DiscoveryError {
    #[error("line {line}: expected a TYPE comment after HELP")]
    MissingType { line: usize },
    #[error("line {line}: expected a metric line after TYPE")]
    MissingName { line: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Metric types announced by `# TYPE` lines
pub enum ExposedType {
    /// A single numerical value that can arbitrarily go up and down
    Gauge,
    /// A single monotonically increasing counter
    Counter,
    /// Observations counted into configurable buckets
    Histogram,
    /// Observations summarised into quantiles
    Summary,
    /// No type information
    Untyped,
}

impl FromStr for ExposedType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            "histogram" => Ok(Self::Histogram),
            "summary" => Ok(Self::Summary),
            "untyped" => Ok(Self::Untyped),
            _ => Err(()),
        }
    }
}

impl ExposedType {
    /// Fold the exposed type onto the two declared types samples carry.
    ///
    /// Histogram and summary series are cumulative.
    #[must_use]
    pub fn classify(self) -> MetricType {
        match self {
            Self::Counter | Self::Histogram | Self::Summary => MetricType::Counter,
            Self::Gauge | Self::Untyped => MetricType::Gauge,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A parsed exposition data line
pub struct ParsedMetric {
    /// The metric name
    pub name: String,
    /// The type announced for this name by a preceding TYPE line, if any
    pub metric_type: Option<ExposedType>,
    /// Trimmed interior of the label block, if the line has a non-empty one
    pub label: Option<String>,
    /// The metric value
    pub value: f64,
    /// Optional timestamp in milliseconds since Unix epoch
    pub timestamp: Option<i64>,
}

#[derive(Debug, Default)]
/// Parser for the data lines of Prometheus text exposition format
pub struct Parser {
    typemap: FxHashMap<String, ExposedType>,
}

impl Parser {
    /// Create a new parser instance
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every data line up to the first blank line.
    ///
    /// Comment lines are skipped; `# TYPE` comments are remembered so that the
    /// lines after them carry their type.
    ///
    /// # Errors
    ///
    /// Returns the first data line error encountered. No partial result is
    /// returned.
    pub fn parse_text(&mut self, text: &str) -> Result<Vec<ParsedMetric>, Error> {
        let mut results = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                break;
            }

            if line.starts_with('#') {
                if line.starts_with(TYPE) {
                    self.parse_type_line(line);
                }
                continue;
            }

            results.push(self.parse_metric_line(idx + 1, line)?);
        }

        Ok(results)
    }

    fn parse_type_line(&mut self, line: &str) {
        let mut parts = line.split_ascii_whitespace().skip(2);
        let (Some(name), Some(metric_type)) = (parts.next(), parts.next()) else {
            debug!("ignoring incomplete TYPE line: {line}");
            return;
        };
        let Ok(metric_type) = metric_type.parse::<ExposedType>() else {
            debug!("ignoring unknown metric type {metric_type} for {name}");
            return;
        };

        // Histogram and summary series carry suffixed names
        if matches!(metric_type, ExposedType::Histogram | ExposedType::Summary) {
            self.typemap.insert(format!("{name}_sum"), metric_type);
            self.typemap.insert(format!("{name}_count"), metric_type);
            self.typemap.insert(format!("{name}_bucket"), metric_type);
        }

        self.typemap.insert(name.to_owned(), metric_type);
    }

    fn parse_metric_line(&self, line_no: usize, line: &str) -> Result<ParsedMetric, Error> {
        let Some(name_end) = line.find(|c: char| c == '{' || c.is_whitespace()) else {
            if line.is_empty() {
                return Err(Error::MissingName { line: line_no });
            }
            return Err(Error::MissingValue {
                line: line_no,
                name: line.to_string(),
            });
        };
        let name = line[..name_end].trim();
        if name.is_empty() {
            return Err(Error::MissingName { line: line_no });
        }

        let rest = &line[name_end..];
        let (label, value_part) = if let Some(labels) = rest.strip_prefix('{') {
            let Some(close) = labels.rfind('}') else {
                return Err(Error::UnclosedLabels {
                    line: line_no,
                    name: name.to_string(),
                });
            };
            let interior = labels[..close].trim();
            let label = (!interior.is_empty()).then(|| interior.to_string());
            (label, &labels[close + 1..])
        } else {
            (None, rest)
        };

        let mut parts = value_part.split_whitespace();
        let value_str = parts.next().ok_or_else(|| Error::MissingValue {
            line: line_no,
            name: name.to_string(),
        })?;
        let value = parse_value(value_str).ok_or_else(|| Error::InvalidValue {
            line: line_no,
            name: name.to_string(),
            value: value_str.to_string(),
        })?;
        let timestamp = match parts.next() {
            Some(ts) => Some(ts.parse::<i64>().map_err(|_| Error::InvalidTimestamp {
                line: line_no,
                name: name.to_string(),
                timestamp: ts.to_string(),
            })?),
            None => None,
        };

        Ok(ParsedMetric {
            name: name.to_string(),
            metric_type: self.typemap.get(name).copied(),
            label,
            value,
            timestamp,
        })
    }
}

fn parse_value(value: &str) -> Option<f64> {
    // Special float values spelled the way the exposition format spells them
    match value {
        "NaN" => Some(f64::NAN),
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        _ => value.parse::<f64>().ok(),
    }
}

/// Describe the metrics announced by `# HELP` / `# TYPE` comment pairs.
///
/// Each `# HELP` line must be followed by a `# TYPE` line and then a data line
/// naming the metric. Any deviation yields an empty list.
#[must_use]
pub fn discover(text: &str) -> Vec<MetricSpec> {
    match try_discover(text) {
        Ok(specs) => specs,
        Err(e) => {
            debug!("discovery abandoned: {e}");
            Vec::new()
        }
    }
}

fn try_discover(text: &str) -> Result<Vec<MetricSpec>, DiscoveryError> {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let mut specs = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        if !line.starts_with(HELP) {
            continue;
        }
        let units = comment_data(line);

        let type_line = lines
            .get(i + 1)
            .filter(|l| l.starts_with(TYPE))
            .ok_or(DiscoveryError::MissingType { line: i + 2 })?;
        let metric_type = comment_data(type_line);
        if metric_type.is_empty() {
            return Err(DiscoveryError::MissingType { line: i + 2 });
        }

        let name_line = lines
            .get(i + 2)
            .filter(|l| !l.starts_with('#'))
            .ok_or(DiscoveryError::MissingName { line: i + 3 })?;
        let name = name_line
            .find(|c: char| c == '{' || c.is_whitespace())
            .map(|end| name_line[..end].trim())
            .filter(|name| !name.is_empty())
            .ok_or(DiscoveryError::MissingName { line: i + 3 })?;

        specs.push(MetricSpec {
            name: name.to_string(),
            metric_type,
            format: "float".to_string(),
            units,
        });
    }

    Ok(specs)
}

/// Words after `# <KEYWORD> <name>`, joined with underscores.
fn comment_data(line: &str) -> String {
    line.split_whitespace().skip(3).collect::<Vec<_>>().join("_")
}
