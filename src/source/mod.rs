mod error;
pub mod prometheus;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

pub use self::error::SourceError;
pub use self::prometheus::PrometheusClient;

/// Label carrying the metric name; never becomes a dimension.
pub const METRIC_NAME_LABEL: &str = "__name__";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }

    /// Whole seconds, rounding towards negative infinity.
    pub fn unix_seconds(&self) -> i64 {
        self.timestamp_ms.div_euclid(1000)
    }
}

/// One labeled series of a range query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<Sample>,
}

impl Series {
    pub fn new<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            samples: Vec::new(),
        }
    }

    pub fn with_sample(mut self, timestamp_ms: i64, value: f64) -> Self {
        self.samples.push(Sample::new(timestamp_ms, value));
        self
    }
}

pub type SeriesMatrix = Vec<Series>;

/// Read access to a metrics backend.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Resolution of range queries.
    fn step(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Range query over `[start, end]` (unix seconds).
    async fn query_samples(
        &self,
        expression: &str,
        start: i64,
        end: i64,
    ) -> Result<SeriesMatrix, SourceError>;

    async fn list_metric_names(&self) -> Result<Vec<String>, SourceError>;

    async fn list_label_values(
        &self,
        metric: &str,
        label: &str,
    ) -> Result<Vec<String>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_seconds_truncates() {
        assert_eq!(Sample::new(1_700_000_000_999, 1.0).unix_seconds(), 1_700_000_000);
        assert_eq!(Sample::new(1_000, 1.0).unix_seconds(), 1);
        assert_eq!(Sample::new(-1, 1.0).unix_seconds(), -1);
    }

    #[test]
    fn series_builder_collects_labels_and_samples() {
        let s = Series::new([("job", "a")]).with_sample(1000, 2.0);
        assert_eq!(s.labels.get("job").map(String::as_str), Some("a"));
        assert_eq!(s.samples.len(), 1);
    }
}
