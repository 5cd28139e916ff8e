//! Monitor -- polls the cloud and metrics clients, classifies breaches into
//! incidents.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::clients::cloud::{CloudResource, CloudResources};
use crate::clients::metrics::MetricsQuery;
use crate::config::Thresholds;
use crate::model::{Incident, MetricKind, Severity};
use crate::storage::IncidentStore;

/// Severity is a pure function of (metric, current value, threshold).
/// `trending_up` only matters for the sub-threshold hysteresis band.
///
/// - value >= 1.15 * threshold        -> critical
/// - value >= threshold               -> high
/// - within 10% below and trending up -> medium
/// - otherwise                        -> no incident
///
/// `service_up` inverts: a value below threshold means the service is down,
/// which is always critical.
pub fn classify_severity(
    metric: MetricKind,
    value: f64,
    threshold: f64,
    trending_up: bool,
) -> Option<Severity> {
    if metric == MetricKind::ServiceUp {
        return if value < threshold {
            Some(Severity::Critical)
        } else {
            None
        };
    }
    if value >= threshold * 1.15 {
        Some(Severity::Critical)
    } else if value >= threshold {
        Some(Severity::High)
    } else if value >= threshold * 0.90 && trending_up {
        Some(Severity::Medium)
    } else {
        None
    }
}

pub struct Monitor {
    cloud: Arc<dyn CloudResources>,
    metrics: Arc<dyn MetricsQuery>,
    store: IncidentStore,
    thresholds: Thresholds,
}

impl Monitor {
    pub fn new(
        cloud: Arc<dyn CloudResources>,
        metrics: Arc<dyn MetricsQuery>,
        store: IncidentStore,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            cloud,
            metrics,
            store,
            thresholds,
        }
    }

    /// One scan over the fleet. Creates one incident per breaching
    /// (resource, metric) pair that does not already have an open incident.
    /// A failing resource is skipped for this cycle, never aborts the scan.
    pub async fn scan(&self) -> Result<Vec<Incident>> {
        let resources = self.cloud.list_resources().await?;
        info!(count = resources.len(), "scanning fleet");

        let results =
            futures::future::join_all(resources.iter().map(|r| self.scan_resource(r))).await;

        let mut created = Vec::new();
        for (resource, result) in resources.iter().zip(results) {
            match result {
                Ok(mut incidents) => created.append(&mut incidents),
                Err(e) => {
                    warn!(resource = %resource.name, error = %e, "skipping resource this cycle");
                }
            }
        }

        info!(incidents = created.len(), "scan complete");
        Ok(created)
    }

    async fn scan_resource(&self, resource: &CloudResource) -> Result<Vec<Incident>> {
        let mut incidents = Vec::new();

        for (metric, threshold) in self.thresholds.table() {
            let Some(value) = self.metrics.instant(&resource.id, metric).await? else {
                debug!(resource = %resource.name, metric = metric.as_str(), "no sample");
                continue;
            };

            // Hysteresis band: only bother with a trend query when the value
            // is close to (but under) the threshold.
            let trending_up = if metric != MetricKind::ServiceUp
                && value < threshold
                && value >= threshold * 0.90
            {
                self.is_trending_up(&resource.id, metric).await
            } else {
                false
            };

            let Some(severity) = classify_severity(metric, value, threshold, trending_up)
            else {
                continue;
            };

            // Idempotence: one open incident per (resource, metric) pair.
            if let Some(open) = self.store.find_open_incident(&resource.id, metric)? {
                debug!(
                    resource = %resource.name,
                    metric = metric.as_str(),
                    open_incident = %open,
                    "breach already tracked"
                );
                continue;
            }

            let mut incident = Incident::new(
                &resource.id,
                &resource.name,
                resource.kind,
                metric,
                value,
                threshold,
                severity,
            );
            incident.metadata = serde_json::json!({
                "resource_status": resource.status,
                "resource_region": resource.region,
                "resource_size": resource.size_slug,
                "detection_method": "metrics_scan",
            });
            self.store.insert_incident(&incident)?;
            info!(
                incident = %incident.id,
                resource = %resource.name,
                metric = metric.as_str(),
                value,
                threshold,
                severity = severity.as_str(),
                "incident created"
            );
            incidents.push(incident);
        }

        Ok(incidents)
    }

    /// Compare the mean of the older and newer halves of a short window.
    /// Any failure here degrades to "not trending", it never fails the scan.
    async fn is_trending_up(&self, resource_id: &str, metric: MetricKind) -> bool {
        let end = Utc::now();
        let start = end - ChronoDuration::minutes(10);
        match self.metrics.range(resource_id, metric, start, end, 60).await {
            Ok(samples) if samples.len() >= 4 => {
                let mid = samples.len() / 2;
                let mean = |s: &[(chrono::DateTime<Utc>, f64)]| {
                    s.iter().map(|(_, v)| v).sum::<f64>() / s.len() as f64
                };
                mean(&samples[mid..]) > mean(&samples[..mid])
            }
            Ok(_) => false,
            Err(e) => {
                debug!(resource_id, metric = metric.as_str(), error = %e, "trend query failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_at_95_2_over_80_is_critical() {
        // 95.2 >= 1.15 * 80 = 92.0
        assert_eq!(
            classify_severity(MetricKind::CpuUsage, 95.2, 80.0, false),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn disk_at_82_over_80_is_high() {
        assert_eq!(
            classify_severity(MetricKind::DiskUsage, 82.0, 80.0, false),
            Some(Severity::High)
        );
    }

    #[test]
    fn below_threshold_trending_up_is_medium() {
        assert_eq!(
            classify_severity(MetricKind::CpuUsage, 74.0, 80.0, true),
            Some(Severity::Medium)
        );
        // Same value without the trend: no incident.
        assert_eq!(classify_severity(MetricKind::CpuUsage, 74.0, 80.0, false), None);
        // Too far below threshold even with a trend.
        assert_eq!(classify_severity(MetricKind::CpuUsage, 60.0, 80.0, true), None);
    }

    #[test]
    fn classification_is_deterministic() {
        for _ in 0..10 {
            assert_eq!(
                classify_severity(MetricKind::MemoryUsage, 97.75, 85.0, false),
                Some(Severity::Critical)
            );
        }
    }

    #[test]
    fn boundary_is_exactly_1_15x() {
        assert_eq!(
            classify_severity(MetricKind::CpuUsage, 92.0, 80.0, false),
            Some(Severity::Critical)
        );
        assert_eq!(
            classify_severity(MetricKind::CpuUsage, 91.99, 80.0, false),
            Some(Severity::High)
        );
    }

    #[test]
    fn service_down_is_critical() {
        assert_eq!(
            classify_severity(MetricKind::ServiceUp, 0.0, 1.0, false),
            Some(Severity::Critical)
        );
        assert_eq!(classify_severity(MetricKind::ServiceUp, 1.0, 1.0, false), None);
    }
}
