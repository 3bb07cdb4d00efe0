//! Collect samples from a configured source
//!
//! A [`Collector`] is built from a validated [`Source`] and polled by its
//! caller; it never schedules itself. Every poll captures the time once, makes
//! exactly one fetch and returns the samples found along with the time at
//! which the source is next due.
//!
//! Failure policy differs by mode. In REST and Generic mode each metric is
//! extracted independently and failures are gathered into an [`Aggregate`]
//! alongside the samples that did succeed. In Prometheus mode a single
//! unparsable value fails the whole poll.

use std::{fmt, path::Path, time::SystemTime};

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::{
    config::{self, PrometheusSource, RegexSource, Source, SourceKind},
    exposition::{self, Parser},
    metric::{MetricSpec, MetricType, Sample, Value},
    rest::{self, Extraction, ExtractionError},
    telemetry,
    transport::{self, Fetch, Http},
};

/// Samples accumulated across Prometheus polls, keyed by metric name.
///
/// Owned by the caller and only ever appended to by collectors.
pub type History = FxHashMap<String, Vec<Sample>>;

#[derive(thiserror::Error, Debug)]
/// Reasons a poll produced no samples
pub enum Error {
    /// See [`crate::transport::Error`] for details.
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// See [`crate::exposition::Error`] for details.
    #[error("Failed to parse exposition text: {0}")]
    Exposition(#[from] exposition::Error),
}

#[derive(thiserror::Error, Debug)]
#[error("Poll failed: {source}")]
/// A failed poll, with the time the source is next due regardless
pub struct PollError {
    /// When the caller should poll again
    pub next_collection: SystemTime,
    /// Why this poll failed
    #[source]
    pub source: Error,
}

/// Every per-metric failure from one REST or Generic poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    errors: Vec<ExtractionError>,
}

impl Aggregate {
    fn from_errors(errors: Vec<ExtractionError>) -> Option<Self> {
        (!errors.is_empty()).then_some(Self { errors })
    }

    /// The individual failures, in configuration order.
    #[must_use]
    pub fn errors(&self) -> &[ExtractionError] {
        &self.errors
    }

    /// Number of metrics that failed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Always false; an [`Aggregate`] is only built from at least one failure.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} metric(s) failed extraction", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Aggregate {}

/// The outcome of one successful poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Poll<T> {
    /// The time shared by every sample of this poll
    pub captured_at: SystemTime,
    /// When the caller should poll again, strictly after `captured_at`
    pub next_collection: SystemTime,
    /// What this poll produced
    pub samples: T,
    /// Per-metric failures, REST and Generic mode only
    pub errors: Option<Aggregate>,
}

/// Samples produced by a poll of any [`Collector`] variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    /// One slot per configured metric, in configuration order. Failed metrics
    /// leave `None` and an entry in [`Poll::errors`].
    Ordered(Vec<Option<Sample>>),
    /// Number of samples appended to the caller's [`History`].
    Appended(usize),
}

/// A collector over any supported source kind.
#[derive(Debug)]
pub enum Collector<F = Http> {
    /// REST and Generic sources
    Rest(Rest<F>),
    /// Prometheus sources
    Prometheus(Prometheus<F>),
}

impl Collector<Http> {
    /// Create a new [`Collector`] that fetches over HTTP.
    #[must_use]
    pub fn new(name: impl Into<String>, source: Source) -> Self {
        Self::with_fetcher(name, source, Http::new())
    }

    /// Load the config at `path` as `kind` and build a [`Collector`] from it.
    ///
    /// # Errors
    ///
    /// See [`crate::config::load`].
    pub fn load(
        name: impl Into<String>,
        path: &Path,
        kind: SourceKind,
    ) -> Result<Self, config::Error> {
        Ok(Self::new(name, config::load(path, kind)?))
    }
}

impl<F: Fetch> Collector<F> {
    /// Create a new [`Collector`] with a caller supplied [`Fetch`].
    #[must_use]
    pub fn with_fetcher(name: impl Into<String>, source: Source, fetcher: F) -> Self {
        let name = name.into();
        match source {
            Source::Rest(source) => Self::Rest(Rest::new(name, SourceKind::Rest, source, fetcher)),
            Source::Generic(source) => {
                Self::Rest(Rest::new(name, SourceKind::Generic, source, fetcher))
            }
            Source::Prometheus(source) => Self::Prometheus(Prometheus::new(name, source, fetcher)),
        }
    }

    /// Name of this collector.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Rest(inner) => inner.name(),
            Self::Prometheus(inner) => inner.name(),
        }
    }

    /// The kind of source this collector polls.
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Rest(inner) => inner.kind,
            Self::Prometheus(_) => SourceKind::Prometheus,
        }
    }

    /// Poll the source once.
    ///
    /// Prometheus collectors append to `history`; REST and Generic collectors
    /// leave it untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch fails or, in Prometheus mode, if any data
    /// line fails to parse.
    pub async fn collect(&self, history: &mut History) -> Result<Poll<Samples>, PollError> {
        match self {
            Self::Rest(inner) => {
                let poll = inner.collect().await?;
                Ok(Poll {
                    captured_at: poll.captured_at,
                    next_collection: poll.next_collection,
                    samples: Samples::Ordered(poll.samples),
                    errors: poll.errors,
                })
            }
            Self::Prometheus(inner) => {
                let poll = inner.collect(history).await?;
                Ok(Poll {
                    captured_at: poll.captured_at,
                    next_collection: poll.next_collection,
                    samples: Samples::Appended(poll.samples),
                    errors: poll.errors,
                })
            }
        }
    }

    /// Describe the metrics the source exposes.
    ///
    /// Only Prometheus sources describe themselves; other kinds yield nothing.
    pub async fn discover(&self) -> Vec<MetricSpec> {
        match self {
            Self::Rest(_) => Vec::new(),
            Self::Prometheus(inner) => inner.discover().await,
        }
    }
}

/// Regular expression collector for REST and Generic sources.
#[derive(Debug)]
pub struct Rest<F = Http> {
    name: String,
    kind: SourceKind,
    source: RegexSource,
    fetcher: F,
}

impl<F: Fetch> Rest<F> {
    /// Create a new [`Rest`] instance
    ///
    /// `kind` is recorded for reporting only; the schedule difference between
    /// REST and Generic sources is settled in the validated `source`.
    #[must_use]
    pub fn new(name: String, kind: SourceKind, source: RegexSource, fetcher: F) -> Self {
        Self {
            name,
            kind,
            source,
            fetcher,
        }
    }

    /// Name of this collector.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Poll the source once, extracting every configured metric.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fetch fails. Per-metric failures are
    /// reported in [`Poll::errors`].
    pub async fn collect(&self) -> Result<Poll<Vec<Option<Sample>>>, PollError> {
        let captured_at = SystemTime::now();
        let next_collection = captured_at + self.source.polling_frequency;

        let text = match self.fetcher.fetch(&self.source.endpoint).await {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    "{name}: failed to fetch {uri}: {e}",
                    name = self.name,
                    uri = self.source.endpoint
                );
                telemetry::poll_failed(&self.name);
                return Err(PollError {
                    next_collection,
                    source: e.into(),
                });
            }
        };

        let Extraction { samples, errors } =
            rest::extract(&text, &self.source.metrics, captured_at);
        let collected = samples.iter().flatten().count();
        telemetry::poll_completed(&self.name, collected, errors.len());

        let errors = Aggregate::from_errors(errors);
        if let Some(errors) = &errors {
            warn!("{name}: {errors}", name = self.name);
        }
        debug!(
            "{name}: collected {collected} of {total} metrics",
            name = self.name,
            total = self.source.metrics.len(),
        );

        Ok(Poll {
            captured_at,
            next_collection,
            samples,
            errors,
        })
    }
}

/// Exposition format collector for Prometheus sources.
#[derive(Debug)]
pub struct Prometheus<F = Http> {
    name: String,
    source: PrometheusSource,
    fetcher: F,
}

impl<F: Fetch> Prometheus<F> {
    /// Create a new [`Prometheus`] instance
    #[must_use]
    pub fn new(name: String, source: PrometheusSource, fetcher: F) -> Self {
        Self {
            name,
            source,
            fetcher,
        }
    }

    /// Name of this collector.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Poll the source once, appending every data line to `history`.
    ///
    /// `history` is left untouched if the poll fails. The returned poll's
    /// samples are the number of entries appended.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch fails or any data line fails to parse.
    pub async fn collect(&self, history: &mut History) -> Result<Poll<usize>, PollError> {
        let captured_at = SystemTime::now();
        let next_collection = captured_at + self.source.polling_frequency;

        let parsed = match self.fetch_and_parse().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("{name}: {e}", name = self.name);
                telemetry::poll_failed(&self.name);
                return Err(PollError {
                    next_collection,
                    source: e,
                });
            }
        };

        let appended = parsed.len();
        for metric in parsed {
            let metric_type = self
                .source
                .configured_type(&metric.name)
                .or_else(|| metric.metric_type.map(exposition::ExposedType::classify))
                .unwrap_or(MetricType::Gauge);
            let sample = Sample {
                name: metric.name.clone(),
                metric_type,
                timestamp: captured_at,
                value: Value::Float(metric.value),
                label: metric.label,
            };
            history.entry(metric.name).or_default().push(sample);
        }
        telemetry::poll_completed(&self.name, appended, 0);
        debug!("{name}: appended {appended} samples", name = self.name);

        Ok(Poll {
            captured_at,
            next_collection,
            samples: appended,
            errors: None,
        })
    }

    async fn fetch_and_parse(&self) -> Result<Vec<exposition::ParsedMetric>, Error> {
        let text = self.fetcher.fetch(&self.source.endpoint).await?;
        let mut parser = Parser::new();
        Ok(parser.parse_text(&text)?)
    }

    /// Describe the metrics the source announces with HELP and TYPE comments.
    ///
    /// Best-effort: a failed fetch or malformed text yields an empty list.
    pub async fn discover(&self) -> Vec<MetricSpec> {
        match self.fetcher.fetch(&self.source.endpoint).await {
            Ok(text) => {
                let specs = exposition::discover(&text);
                info!("{name}: discovered {n} metrics", name = self.name, n = specs.len());
                specs
            }
            Err(e) => {
                debug!("{name}: discovery fetch failed: {e}", name = self.name);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use reqwest::Url;
    use warp::Filter;

    use super::*;

    const NGINX_STATUS: &str = "Active connections: 3\n\
                                server accepts handled requests\n\
                                5 5 32\n\
                                Reading: 0 Writing: 1 Waiting: 2\n";

    const CADVISOR: &str = r#"# HELP container_cpu_system_seconds_total Cumulative system cpu time consumed in seconds.
# TYPE container_cpu_system_seconds_total counter
container_cpu_system_seconds_total{id="/"} 112.04
container_cpu_system_seconds_total{id="/docker"} 3.5
# HELP container_cpu_usage_seconds_total Cumulative cpu time consumed in seconds.
# TYPE container_cpu_usage_seconds_total gauge
container_cpu_usage_seconds_total{id="/"} 250.5
# HELP process_open_fds Number of open file descriptors.
# TYPE process_open_fds gauge
process_open_fds 9
"#;

    /// Serves the same body on every fetch.
    #[derive(Debug)]
    struct Canned(&'static str);

    impl Fetch for Canned {
        async fn fetch(&self, _uri: &Url) -> Result<String, transport::Error> {
            Ok(self.0.to_string())
        }
    }

    fn sample_config(file: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("config")
            .join(file)
    }

    fn collector(file: &str, kind: SourceKind, body: &'static str) -> Collector<Canned> {
        let source = config::load(&sample_config(file), kind).unwrap();
        Collector::with_fetcher(kind.to_string(), source, Canned(body))
    }

    fn ordered(samples: Samples) -> Vec<Option<Sample>> {
        match samples {
            Samples::Ordered(samples) => samples,
            Samples::Appended(_) => panic!("expected ordered samples"),
        }
    }

    fn int(slot: &Option<Sample>) -> i64 {
        slot.as_ref()
            .and_then(|s| s.value.as_i64())
            .expect("integer sample")
    }

    #[tokio::test]
    async fn rest_collects_nginx_status() {
        let c = collector("sample_config.json", SourceKind::Rest, NGINX_STATUS);
        assert_eq!(c.name(), "REST");
        assert_eq!(c.kind(), SourceKind::Rest);

        let mut history = History::default();
        let poll = c.collect(&mut history).await.unwrap();
        assert!(poll.errors.is_none());
        assert!(history.is_empty());
        assert_eq!(poll.next_collection, poll.captured_at + Duration::from_secs(10));

        let samples = ordered(poll.samples);
        let names: Vec<_> = samples
            .iter()
            .map(|s| s.as_ref().unwrap().name.as_str())
            .collect();
        assert_eq!(names, ["activeConnections", "reading", "writing", "waiting"]);
        assert_eq!(samples[0].as_ref().unwrap().metric_type, MetricType::Gauge);
        assert!(
            samples
                .iter()
                .all(|s| s.as_ref().unwrap().timestamp == poll.captured_at)
        );
        // Active connections = reading + writing + waiting
        assert_eq!(
            int(&samples[0]),
            int(&samples[1]) + int(&samples[2]) + int(&samples[3])
        );
    }

    #[tokio::test]
    async fn rest_isolates_missing_metric() {
        let c = collector(
            "sample_config.json",
            SourceKind::Rest,
            "Active connections: 3\nReading: 0 Writing: 1\n",
        );
        let poll = c.collect(&mut History::default()).await.unwrap();

        let samples = ordered(poll.samples);
        assert_eq!(samples.len(), 4);
        assert_eq!(int(&samples[0]), 3);
        assert_eq!(int(&samples[2]), 1);
        assert!(samples[3].is_none());

        let errors = poll.errors.expect("aggregated errors");
        assert_eq!(errors.len(), 1);
        let message = errors.to_string();
        assert!(message.contains("waiting"), "{message}");
        assert!(message.contains(".*Waiting: ([0-9]+)"), "{message}");
    }

    #[tokio::test]
    async fn aggregate_keeps_every_message() {
        let c = collector("sample_config.json", SourceKind::Rest, "nothing here\n");
        let poll = c.collect(&mut History::default()).await.unwrap();

        assert!(ordered(poll.samples).iter().all(Option::is_none));
        let errors = poll.errors.expect("aggregated errors");
        assert_eq!(errors.len(), 4);
        let message = errors.to_string();
        for name in ["activeConnections", "reading", "writing", "waiting"] {
            assert!(message.contains(name), "{message}");
        }
    }

    #[tokio::test]
    async fn generic_schedules_by_fastest_metric() {
        let c = collector("sample_config_generic.json", SourceKind::Generic, NGINX_STATUS);
        assert_eq!(c.kind(), SourceKind::Generic);

        let poll = c.collect(&mut History::default()).await.unwrap();
        assert_eq!(poll.next_collection, poll.captured_at + Duration::from_secs(5));
        assert_eq!(ordered(poll.samples).len(), 4);
    }

    #[tokio::test]
    async fn prometheus_appends_across_polls() {
        let c = collector(
            "sample_config_prometheus.json",
            SourceKind::Prometheus,
            CADVISOR,
        );
        let mut history = History::default();

        let first = c.collect(&mut history).await.unwrap();
        assert_eq!(first.samples, Samples::Appended(4));
        assert!(first.next_collection > first.captured_at);
        let second = c.collect(&mut history).await.unwrap();
        assert_eq!(second.samples, Samples::Appended(4));

        let system = &history["container_cpu_system_seconds_total"];
        assert_eq!(system.len(), 4);
        assert_eq!(system[0].label.as_deref(), Some(r#"id="/""#));
        assert_eq!(system[1].label.as_deref(), Some(r#"id="/docker""#));
        assert_eq!(system[1].value, Value::Float(3.5));
        assert_eq!(system[0].metric_type, MetricType::Counter);
        assert_eq!(system[0].timestamp, first.captured_at);
        assert_eq!(system[2].timestamp, second.captured_at);

        // The configured type wins over the announced gauge.
        let usage = &history["container_cpu_usage_seconds_total"];
        assert_eq!(usage[0].metric_type, MetricType::Counter);

        let fds = &history["process_open_fds"];
        assert_eq!(fds.len(), 2);
        assert_eq!(fds[0].metric_type, MetricType::Gauge);
        assert!(fds[0].label.is_none());
    }

    #[tokio::test]
    async fn prometheus_bad_value_fails_the_poll() {
        let body = "process_open_fds 9\ncontainer_cpu_usage_seconds_total{id=\"/\"} lots\n";
        let c = collector("sample_config_prometheus.json", SourceKind::Prometheus, body);
        let mut history = History::default();

        let err = c.collect(&mut history).await.unwrap_err();
        assert!(matches!(
            err.source,
            Error::Exposition(exposition::Error::InvalidValue { .. })
        ));
        assert!(err.next_collection > SystemTime::UNIX_EPOCH);
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn same_bad_value_is_isolated_in_rest_mode() {
        let body = "process_open_fds 9\ncontainer_cpu_usage_seconds_total{id=\"/\"} lots\n";
        let json = r#"{
            "source": "http://localhost:8080/metrics",
            "polling_frequency": 10,
            "metrics_config": [
                {"name": "process_open_fds", "metric_type": "gauge", "units": "float", "regex": "^process_open_fds (.*)$"},
                {"name": "container_cpu_usage_seconds_total", "metric_type": "counter", "units": "float", "regex": "^container_cpu_usage_seconds_total\\{.*\\} (.*)$"}
            ]
        }"#;
        let source = config::from_slice(json.as_bytes(), SourceKind::Rest).unwrap();
        let c = Collector::with_fetcher("rest", source, Canned(body));

        let poll = c.collect(&mut History::default()).await.unwrap();
        let samples = ordered(poll.samples);
        assert_eq!(
            samples[0].as_ref().map(|s| s.value),
            Some(Value::Float(9.0))
        );
        assert!(samples[1].is_none());
        assert!(matches!(
            poll.errors.unwrap().errors(),
            [ExtractionError::ValueParse { text, .. }] if text == "lots"
        ));
    }

    #[tokio::test]
    async fn discovery_through_collector() {
        let c = collector(
            "sample_config_prometheus.json",
            SourceKind::Prometheus,
            CADVISOR,
        );
        let specs = c.discover().await;
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "container_cpu_system_seconds_total",
                "container_cpu_usage_seconds_total",
                "process_open_fds",
            ]
        );

        let rest = collector("sample_config.json", SourceKind::Rest, NGINX_STATUS);
        assert!(rest.discover().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_source_fails_poll_and_discovery() {
        let json = r#"{"source": "http://127.0.0.1:1/metrics", "metrics_config": [{"name": "up"}]}"#;
        let source = config::from_slice(json.as_bytes(), SourceKind::Prometheus).unwrap();
        let c = Collector::new("down", source);

        let mut history = History::default();
        let before = SystemTime::now();
        let err = c.collect(&mut history).await.unwrap_err();
        assert!(matches!(err.source, Error::Transport(_)));
        assert!(err.next_collection > before);
        assert!(c.discover().await.is_empty());
    }

    #[tokio::test]
    async fn rest_over_http() {
        let server = warp::serve(warp::path("nginx_status").map(|| NGINX_STATUS));
        let (addr, serve_fut) = server.bind_ephemeral(([127, 0, 0, 1], 0));
        let _server_handle = tokio::spawn(serve_fut);

        let json = include_str!("../config/sample_config.json").replace(
            "http://localhost:8000/nginx_status",
            &format!("http://{addr}/nginx_status"),
        );
        let source = config::from_slice(json.as_bytes(), SourceKind::Rest).unwrap();
        let c = Collector::new("nginx", source);

        let poll = c.collect(&mut History::default()).await.unwrap();
        assert!(poll.errors.is_none());
        let samples = ordered(poll.samples);
        assert_eq!(
            int(&samples[0]),
            int(&samples[1]) + int(&samples[2]) + int(&samples[3])
        );
    }

    #[test]
    fn load_builds_collector_from_file() {
        let c = Collector::load(
            "nginx",
            &sample_config("sample_config.json"),
            SourceKind::Rest,
        )
        .unwrap();
        assert_eq!(c.name(), "nginx");
        assert_eq!(c.kind(), SourceKind::Rest);

        let c = Collector::load(
            "cadvisor",
            &sample_config("sample_config_prometheus.json"),
            SourceKind::Prometheus,
        )
        .unwrap();
        assert!(matches!(c, Collector::Prometheus(_)));

        assert!(matches!(
            Collector::load(
                "nginx",
                &sample_config("does_not_exist.json"),
                SourceKind::Rest,
            ),
            Err(config::Error::ReadFile { .. })
        ));
    }
}
