//! Samples and the types that classify them
//!
//! Everything a collector hands back to its caller lives here. A [`Sample`] is
//! built once per metric per poll and never mutated afterward.

use std::{fmt, str::FromStr, time::SystemTime};

use serde::Serialize;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors produced when classifying declared metric strings
pub enum Error {
    /// The declared metric type is neither `counter` nor `gauge`
    #[error("unknown metric type: {0}")]
    UnknownMetricType(String),
    /// The declared units are not one of `integer`, `int` or `float`
    #[error("unknown units: {0}")]
    UnknownUnits(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
/// The declared shape of a metric over time
pub enum MetricType {
    /// Monotonically non-decreasing across samples
    Counter,
    /// Free to rise or fall between samples
    Gauge,
}

impl FromStr for MetricType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            _ => Err(Error::UnknownMetricType(s.to_string())),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter => write!(f, "counter"),
            Self::Gauge => write!(f, "gauge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
/// How the captured text of a metric is turned into a number
pub enum ValueKind {
    /// Base-10 signed 64-bit integer
    Integer,
    /// 64-bit floating point
    Float,
}

impl FromStr for ValueKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integer" | "int" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            _ => Err(Error::UnknownUnits(s.to_string())),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::Float => write!(f, "float"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
/// A sampled numeric value
pub enum Value {
    /// See [`ValueKind::Integer`]
    Int(i64),
    /// See [`ValueKind::Float`]
    Float(f64),
}

impl Value {
    /// Return the value widened to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    /// Return the integer value, if this is one.
    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(v),
            Self::Float(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// One timestamped observation of a named metric
pub struct Sample {
    /// Name of the metric as configured or as exposed by the source
    pub name: String,
    /// Declared type of the metric
    pub metric_type: MetricType,
    /// Capture time of the poll that produced this sample
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: SystemTime,
    /// The observed value
    pub value: Value,
    /// Raw label block, Prometheus mode only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[allow(clippy::cast_possible_truncation)]
fn serialize_timestamp<S>(ts: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let millis = ts
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);
    serializer.serialize_u64(millis)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// The shape of a metric as announced by exposition comments, without a value
pub struct MetricSpec {
    /// Metric name taken from the first data line after the comments
    pub name: String,
    /// Type string from the `# TYPE` line, unvalidated
    pub metric_type: String,
    /// Value format, always `float` for exposition sources
    pub format: String,
    /// Help text from the `# HELP` line
    pub units: String,
}
