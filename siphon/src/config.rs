//! This module controls configuration parsing from the end user. Every
//! structural problem with a source -- bad JSON, an empty metric list, a
//! regular expression that will not compile -- is caught here, before a
//! collector exists. Polls never fail for configuration reasons.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::metric::{self, MetricType, ValueKind};

/// Errors produced while loading a source configuration
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error reading a config file from disk
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The configuration is not valid JSON or does not match the schema
    #[error("Malformed configuration: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The configuration lists no metrics
    #[error("No metrics provided in config")]
    EmptyMetricList,
    /// The requested source kind is not one this agent knows
    #[error("No support for source kind {0}")]
    UnsupportedSourceKind(String),
    /// The endpoint is not an absolute http(s) URI
    #[error("Invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint {
        /// Endpoint as written in the config
        endpoint: String,
        /// Why it was rejected
        reason: String,
    },
    /// A metric's regular expression does not compile
    #[error("Invalid regexp {pattern} for metric {metric}: {source}")]
    InvalidPattern {
        /// Metric name
        metric: String,
        /// Pattern as written in the config
        pattern: String,
        /// Underlying regex error
        #[source]
        source: Box<regex::Error>,
    },
    /// A metric's regular expression has no group to capture the value with
    #[error("Regexp {pattern} for metric {metric} has no capture group")]
    MissingCaptureGroup {
        /// Metric name
        metric: String,
        /// Pattern as written in the config
        pattern: String,
    },
    /// A metric declares a type other than `counter` or `gauge`
    #[error("Unexpected value {value:?} of 'metric_type' for metric {metric}")]
    UnknownMetricType {
        /// Metric name
        metric: String,
        /// Declared type
        value: String,
    },
    /// A metric declares units other than `integer`, `int` or `float`
    #[error("Unexpected value {value:?} of 'units' for metric {metric}")]
    UnknownUnits {
        /// Metric name
        metric: String,
        /// Declared units
        value: String,
    },
    /// A metric omits a field its source kind requires
    #[error("Metric {metric} is missing required field '{field}'")]
    MissingField {
        /// Metric name
        metric: String,
        /// Field name
        field: &'static str,
    },
}

/// The smallest interval between two polls of one source.
///
/// Frequencies are whole seconds, so this is the shortest non-zero frequency a
/// config can express. A frequency of zero is raised to it.
pub const MIN_POLLING_FREQUENCY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The protocol spoken by a metrics source
pub enum SourceKind {
    /// Per-metric regular expressions over an arbitrary text page
    Rest,
    /// Prometheus text exposition format
    Prometheus,
    /// Regular expressions with a per-metric polling frequency
    Generic,
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rest" => Ok(Self::Rest),
            "prometheus" => Ok(Self::Prometheus),
            "generic" => Ok(Self::Generic),
            _ => Err(Error::UnsupportedSourceKind(s.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rest => write!(f, "REST"),
            Self::Prometheus => write!(f, "Prometheus"),
            Self::Generic => write!(f, "Generic"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
    #[serde(alias = "source")]
    endpoint: String,
    #[serde(default, rename = "pollingFrequency", alias = "polling_frequency")]
    polling_frequency: u32,
    #[serde(default, rename = "metricsConfig", alias = "metrics_config")]
    metrics: Vec<RawMetric>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMetric {
    name: String,
    #[serde(default, rename = "metricType", alias = "metric_type")]
    metric_type: Option<String>,
    #[serde(default)]
    units: Option<String>,
    #[serde(default, rename = "pollingFrequency", alias = "polling_frequency")]
    polling_frequency: Option<u32>,
    #[serde(default)]
    regex: Option<String>,
}

#[derive(Debug, Clone)]
/// A metric located by regular expression, compiled and classified
pub struct Descriptor {
    /// Metric name
    pub name: String,
    /// Declared type
    pub metric_type: MetricType,
    /// How the captured text is parsed
    pub value_kind: ValueKind,
    /// Compiled pattern; the first capture group carries the value
    pub pattern: Regex,
    /// Polling frequency of this metric
    pub polling_frequency: Duration,
}

#[derive(Debug, Clone)]
/// A validated REST or Generic source
pub struct RegexSource {
    /// URI to scrape
    pub endpoint: Url,
    /// Interval between polls of this source
    pub polling_frequency: Duration,
    /// Metrics to extract, in output order
    pub metrics: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A metric named in a Prometheus source config
pub struct PrometheusMetric {
    /// Metric name
    pub name: String,
    /// Overrides the type announced by the exposition text
    pub metric_type: Option<MetricType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A validated Prometheus source
pub struct PrometheusSource {
    /// URI to scrape
    pub endpoint: Url,
    /// Interval between polls of this source
    pub polling_frequency: Duration,
    /// Metrics named in the config
    pub metrics: Vec<PrometheusMetric>,
}

impl PrometheusSource {
    /// Declared type configured for `name`, if any.
    #[must_use]
    pub fn configured_type(&self, name: &str) -> Option<MetricType> {
        self.metrics
            .iter()
            .find(|m| m.name == name)
            .and_then(|m| m.metric_type)
    }
}

#[derive(Debug, Clone)]
/// A validated source configuration, one variant per [`SourceKind`]
pub enum Source {
    /// See [`SourceKind::Rest`]
    Rest(RegexSource),
    /// See [`SourceKind::Prometheus`]
    Prometheus(PrometheusSource),
    /// See [`SourceKind::Generic`]
    Generic(RegexSource),
}

impl Source {
    /// The kind this source was loaded as.
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Rest(_) => SourceKind::Rest,
            Self::Prometheus(_) => SourceKind::Prometheus,
            Self::Generic(_) => SourceKind::Generic,
        }
    }

    /// URI this source is scraped from.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        match self {
            Self::Rest(s) | Self::Generic(s) => &s.endpoint,
            Self::Prometheus(s) => &s.endpoint,
        }
    }

    /// Interval between two polls of this source.
    #[must_use]
    pub fn polling_frequency(&self) -> Duration {
        match self {
            Self::Rest(s) | Self::Generic(s) => s.polling_frequency,
            Self::Prometheus(s) => s.polling_frequency,
        }
    }
}

/// Load and validate the source configuration at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or if its contents do not
/// validate, see [`from_slice`].
pub fn load(path: &Path, kind: SourceKind) -> Result<Source, Error> {
    let contents = fs::read(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    from_slice(&contents, kind)
}

/// Parse and validate a source configuration of the given kind.
///
/// Every metric's pattern is compiled here, once.
///
/// # Errors
///
/// Returns an error if the JSON is malformed, if no metrics are listed, if the
/// endpoint is not an http(s) URI, or if any metric is missing a field, declares
/// an unknown type or units, or carries a pattern that does not compile or has
/// no capture group.
pub fn from_slice(bytes: &[u8], kind: SourceKind) -> Result<Source, Error> {
    let raw: RawSource = serde_json::from_slice(bytes)?;
    if raw.metrics.is_empty() {
        return Err(Error::EmptyMetricList);
    }
    let endpoint = parse_endpoint(&raw.endpoint)?;
    let source_frequency = Duration::from_secs(u64::from(raw.polling_frequency));

    let source = match kind {
        SourceKind::Prometheus => {
            let metrics = raw
                .metrics
                .into_iter()
                .map(prometheus_metric)
                .collect::<Result<Vec<_>, Error>>()?;
            Source::Prometheus(PrometheusSource {
                endpoint,
                polling_frequency: source_frequency.max(MIN_POLLING_FREQUENCY),
                metrics,
            })
        }
        SourceKind::Rest => {
            let metrics = raw
                .metrics
                .into_iter()
                .map(|m| descriptor(m, source_frequency))
                .collect::<Result<Vec<_>, Error>>()?;
            Source::Rest(RegexSource {
                endpoint,
                polling_frequency: source_frequency.max(MIN_POLLING_FREQUENCY),
                metrics,
            })
        }
        SourceKind::Generic => {
            let metrics = raw
                .metrics
                .into_iter()
                .map(|m| descriptor(m, source_frequency))
                .collect::<Result<Vec<_>, Error>>()?;
            // The collector is due again as soon as its most frequent metric is.
            let polling_frequency = metrics
                .iter()
                .map(|m| m.polling_frequency)
                .min()
                .unwrap_or(source_frequency);
            Source::Generic(RegexSource {
                endpoint,
                polling_frequency: polling_frequency.max(MIN_POLLING_FREQUENCY),
                metrics,
            })
        }
    };
    debug!(
        "loaded {kind} source for {endpoint} polling every {frequency:?}",
        endpoint = source.endpoint(),
        frequency = source.polling_frequency(),
    );
    Ok(source)
}

fn parse_endpoint(endpoint: &str) -> Result<Url, Error> {
    let url = Url::parse(endpoint).map_err(|e| Error::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(Error::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: format!("unsupported scheme {scheme}"),
        }),
    }
}

fn descriptor(raw: RawMetric, default_frequency: Duration) -> Result<Descriptor, Error> {
    let RawMetric {
        name,
        metric_type,
        units,
        polling_frequency,
        regex,
    } = raw;

    let Some(metric_type) = metric_type else {
        return Err(Error::MissingField {
            metric: name,
            field: "metric_type",
        });
    };
    let Some(units) = units else {
        return Err(Error::MissingField {
            metric: name,
            field: "units",
        });
    };
    let Some(pattern) = regex else {
        return Err(Error::MissingField {
            metric: name,
            field: "regex",
        });
    };

    let metric_type = classify_type(&name, &metric_type)?;
    let value_kind = units.parse::<ValueKind>().map_err(|_| Error::UnknownUnits {
        metric: name.clone(),
        value: units,
    })?;

    let compiled = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(source) => {
            return Err(Error::InvalidPattern {
                metric: name,
                pattern,
                source: Box::new(source),
            });
        }
    };
    // Slot 0 is the implicit whole-match group.
    if compiled.captures_len() < 2 {
        return Err(Error::MissingCaptureGroup {
            metric: name,
            pattern,
        });
    }

    Ok(Descriptor {
        name,
        metric_type,
        value_kind,
        pattern: compiled,
        polling_frequency: polling_frequency.map_or(default_frequency, |secs| {
            Duration::from_secs(u64::from(secs))
        }),
    })
}

fn prometheus_metric(raw: RawMetric) -> Result<PrometheusMetric, Error> {
    let metric_type = match raw.metric_type {
        Some(declared) => Some(classify_type(&raw.name, &declared)?),
        None => None,
    };
    if let Some(pattern) = raw.regex {
        debug!(
            "ignoring regexp {pattern} for Prometheus metric {name}",
            name = raw.name
        );
    }
    Ok(PrometheusMetric {
        name: raw.name,
        metric_type,
    })
}

fn classify_type(name: &str, declared: &str) -> Result<MetricType, Error> {
    declared.parse::<MetricType>().map_err(|e| match e {
        metric::Error::UnknownMetricType(value) | metric::Error::UnknownUnits(value) => {
            Error::UnknownMetricType {
                metric: name.to_string(),
                value,
            }
        }
    })
}
