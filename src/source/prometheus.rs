use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::Deserialize;

use super::{MetricsSource, Sample, Series, SeriesMatrix, SourceError, METRIC_NAME_LABEL};

static HTTP_CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

/// Process-wide HTTP client, built on first use and shared afterwards.
///
/// The TLS setting of the first caller wins.
pub fn shared_http_client(insecure_skip_verify: bool) -> Result<&'static reqwest::Client, SourceError> {
    HTTP_CLIENT.get_or_try_init(|| {
        log::debug!("Initializing Prometheus HTTP client (insecure_skip_verify={insecure_skip_verify})");
        reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()
            .map_err(SourceError::from)
    })
}

#[derive(Deserialize, Debug)]
struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct RangeData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<RangeResult>,
}

#[derive(Deserialize, Debug)]
struct RangeResult {
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Prometheus HTTP API client.
pub struct PrometheusClient {
    client: &'static reqwest::Client,
    base_url: String,
    step: Duration,
    timeout: Duration,
}

impl PrometheusClient {
    pub fn new(
        base_url: impl Into<String>,
        step: Duration,
        timeout: Duration,
        insecure_skip_verify: bool,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: shared_http_client(insecure_skip_verify)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            step,
            timeout,
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(params)
            .timeout(self.timeout)
            .send()
            .await?;
        let body = resp.text().await?;
        let parsed: ApiResponse<T> = serde_json::from_str(&body)
            .map_err(|e| SourceError::DecodeError(format!("{url}: {e}")))?;

        // Warnings are logged even when the call itself failed.
        for warning in &parsed.warnings {
            log::warn!("Prometheus warning for {path}: {warning}");
        }

        if parsed.status != "success" {
            return Err(SourceError::QueryError(format!(
                "{}: {}",
                parsed.error_type.unwrap_or_else(|| "unknown".to_string()),
                parsed.error.unwrap_or_default()
            )));
        }
        parsed
            .data
            .ok_or_else(|| SourceError::DecodeError(format!("{url}: response without data")))
    }
}

fn parse_matrix(data: RangeData) -> Result<SeriesMatrix, SourceError> {
    if data.result_type != "matrix" {
        return Err(SourceError::DecodeError(format!(
            "expected matrix result, got {}",
            data.result_type
        )));
    }

    data.result
        .into_iter()
        .map(|r| {
            let samples = r
                .values
                .into_iter()
                .map(|(ts, raw)| {
                    let value = raw
                        .parse::<f64>()
                        .map_err(|_| SourceError::DecodeError(format!("invalid sample value: {raw}")))?;
                    Ok(Sample::new((ts * 1000.0).round() as i64, value))
                })
                .collect::<Result<Vec<_>, SourceError>>()?;
            Ok(Series {
                labels: r.metric,
                samples,
            })
        })
        .collect()
}

#[async_trait]
impl MetricsSource for PrometheusClient {
    fn step(&self) -> Duration {
        self.step
    }

    async fn query_samples(
        &self,
        expression: &str,
        start: i64,
        end: i64,
    ) -> Result<SeriesMatrix, SourceError> {
        log::info!("Querying Prometheus: {expression} [{start}, {end}]");
        let params = [
            ("query", expression.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("step", format!("{}s", self.step.as_secs().max(1))),
            ("timeout", format!("{}s", self.timeout.as_secs().max(1))),
        ];
        let data: RangeData = self.get("/api/v1/query_range", &params).await?;
        parse_matrix(data)
    }

    async fn list_metric_names(&self) -> Result<Vec<String>, SourceError> {
        self.get(&format!("/api/v1/label/{METRIC_NAME_LABEL}/values"), &[])
            .await
    }

    async fn list_label_values(
        &self,
        metric: &str,
        label: &str,
    ) -> Result<Vec<String>, SourceError> {
        let params = [("match[]", metric.to_string())];
        self.get(&format!("/api/v1/label/{label}/values"), &params)
            .await
    }
}
