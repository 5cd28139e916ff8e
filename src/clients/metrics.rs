//! Metrics query client -- instant and range telemetry lookups.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{with_retries, ClientError};
use crate::model::MetricKind;

#[async_trait]
pub trait MetricsQuery: Send + Sync {
    /// Current value of a metric for one resource, or None if the backend
    /// has no sample for it.
    async fn instant(
        &self,
        resource_id: &str,
        metric: MetricKind,
    ) -> Result<Option<f64>, ClientError>;

    /// Samples over a window, oldest first.
    async fn range(
        &self,
        resource_id: &str,
        metric: MetricKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_secs: u64,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, ClientError>;
}

/// HTTP implementation against a Prometheus-style query API.
pub struct HttpMetricsClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetricsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn promql(resource_id: &str, metric: MetricKind) -> String {
        let instance = format!("{resource_id}:9100");
        match metric {
            MetricKind::CpuUsage => format!(
                "100 - (avg by (instance) (rate(node_cpu_seconds_total{{instance=\"{instance}\",mode=\"idle\"}}[5m])) * 100)"
            ),
            MetricKind::MemoryUsage => format!(
                "100 * (1 - (node_memory_MemAvailable_bytes{{instance=\"{instance}\"}} / node_memory_MemTotal_bytes{{instance=\"{instance}\"}}))"
            ),
            MetricKind::DiskUsage => format!(
                "100 - ((node_filesystem_avail_bytes{{instance=\"{instance}\",mountpoint=\"/\"}} / node_filesystem_size_bytes{{instance=\"{instance}\",mountpoint=\"/\"}}) * 100)"
            ),
            MetricKind::ServiceUp => format!("up{{instance=\"{instance}\"}}"),
            other => format!("{}{{instance=\"{instance}\"}}", other.as_str()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
}

#[derive(Debug, Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<PromSeries>,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    #[serde(default)]
    value: Option<(f64, String)>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

fn parse_sample(ts: f64, raw: &str) -> Result<(DateTime<Utc>, f64), ClientError> {
    let value: f64 = raw
        .parse()
        .map_err(|_| ClientError::Malformed(format!("non-numeric sample {raw:?}")))?;
    let when = DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .ok_or_else(|| ClientError::Malformed(format!("bad sample timestamp {ts}")))?;
    Ok((when, value))
}

#[async_trait]
impl MetricsQuery for HttpMetricsClient {
    async fn instant(
        &self,
        resource_id: &str,
        metric: MetricKind,
    ) -> Result<Option<f64>, ClientError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let query = Self::promql(resource_id, metric);

        let body: PromResponse = with_retries("metrics.instant", 3, || async {
            let resp = self
                .client
                .get(&url)
                .query(&[("query", query.as_str())])
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(ClientError::Status(resp.status().as_u16()));
            }
            resp.json()
                .await
                .map_err(|e| ClientError::Malformed(e.to_string()))
        })
        .await?;

        if body.status != "success" {
            return Err(ClientError::Malformed(format!(
                "query status {}",
                body.status
            )));
        }

        let sample = body
            .data
            .and_then(|d| d.result.into_iter().next())
            .and_then(|s| s.value);
        match sample {
            Some((ts, raw)) => Ok(Some(parse_sample(ts, &raw)?.1)),
            None => Ok(None),
        }
    }

    async fn range(
        &self,
        resource_id: &str,
        metric: MetricKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_secs: u64,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, ClientError> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let query = Self::promql(resource_id, metric);
        let step = format!("{step_secs}s");

        let body: PromResponse = with_retries("metrics.range", 3, || async {
            let resp = self
                .client
                .get(&url)
                .query(&[
                    ("query", query.as_str()),
                    ("start", &start.timestamp().to_string()),
                    ("end", &end.timestamp().to_string()),
                    ("step", step.as_str()),
                ])
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(ClientError::Status(resp.status().as_u16()));
            }
            resp.json()
                .await
                .map_err(|e| ClientError::Malformed(e.to_string()))
        })
        .await?;

        let mut samples = Vec::new();
        if let Some(series) = body.data.and_then(|d| d.result.into_iter().next()) {
            for (ts, raw) in series.values {
                samples.push(parse_sample(ts, &raw)?);
            }
        }
        Ok(samples)
    }
}
