//! Configuration -- TOML file with compiled-in defaults, env-var overrides
//! for secrets.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::MetricKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API server bind address.
    pub bind: String,
    pub db_path: String,
    /// Seconds between orchestrator scan cycles.
    pub poll_interval_secs: u64,
    /// Upper bound on concurrently running incident pipelines.
    pub worker_limit: usize,
    /// Diagnoses below this confidence are escalated, never auto-remediated.
    pub confidence_threshold: f64,
    pub auto_remediation: bool,
    /// Monthly cost ceiling (USD) above which actions need human approval.
    pub cost_ceiling: f64,
    pub thresholds: Thresholds,
    pub verification: Verification,
    pub collaborators: Collaborators,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
}

impl Thresholds {
    /// The per-metric threshold table the monitor scans against.
    pub fn table(&self) -> BTreeMap<MetricKind, f64> {
        let mut table = BTreeMap::new();
        table.insert(MetricKind::CpuUsage, self.cpu_usage);
        table.insert(MetricKind::MemoryUsage, self.memory_usage);
        table.insert(MetricKind::DiskUsage, self.disk_usage);
        table.insert(MetricKind::ServiceUp, 1.0);
        table
    }

    pub fn for_metric(&self, metric: MetricKind) -> Option<f64> {
        self.table().get(&metric).copied()
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_usage: 80.0,
            memory_usage: 85.0,
            disk_usage: 90.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Verification {
    /// Total window the executor waits for the triggering metric to recover.
    pub deadline_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for Verification {
    fn default() -> Self {
        Self {
            deadline_secs: 180,
            poll_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Collaborators {
    pub cloud_api: String,
    pub cloud_token: String,
    /// Only resources carrying this tag are monitored.
    pub cloud_tag: String,
    pub metrics_api: String,
    pub knowledge_api: String,
    pub reasoning_api: String,
    pub reasoning_key: String,
    pub iac_binary: String,
    pub iac_workdir: String,
    pub request_timeout_secs: u64,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            cloud_api: "https://api.digitalocean.com".to_string(),
            cloud_token: String::new(),
            cloud_tag: "inframedic".to_string(),
            metrics_api: "http://localhost:9090".to_string(),
            knowledge_api: "http://localhost:8100".to_string(),
            reasoning_api: "http://localhost:8200".to_string(),
            reasoning_key: String::new(),
            iac_binary: "terraform".to_string(),
            iac_workdir: "data/iac".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Collaborators {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: "data/inframedic.db".to_string(),
            poll_interval_secs: 30,
            worker_limit: 4,
            confidence_threshold: 0.85,
            auto_remediation: true,
            cost_ceiling: 50.0,
            thresholds: Thresholds::default(),
            verification: Verification::default(),
            collaborators: Collaborators::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file if it exists, otherwise defaults. Secrets come
    /// from the environment and always win over the file.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config {}", p.display()))?
            }
            _ => Config::default(),
        };

        if let Ok(token) = std::env::var("INFRAMEDIC_CLOUD_TOKEN") {
            config.collaborators.cloud_token = token;
        }
        if let Ok(key) = std::env::var("INFRAMEDIC_REASONING_KEY") {
            config.collaborators.reasoning_key = key;
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let config = Config::default();
        assert!((config.confidence_threshold - 0.85).abs() < f64::EPSILON);
        assert!((config.cost_ceiling - 50.0).abs() < f64::EPSILON);
        assert_eq!(config.poll_interval_secs, 30);
        assert!((config.thresholds.cpu_usage - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            poll_interval_secs = 60

            [thresholds]
            cpu_usage = 75.0
            "#,
        )
        .unwrap();
        assert_eq!(parsed.poll_interval_secs, 60);
        assert!((parsed.thresholds.cpu_usage - 75.0).abs() < f64::EPSILON);
        assert!((parsed.thresholds.disk_usage - 90.0).abs() < f64::EPSILON);
        assert_eq!(parsed.bind, "0.0.0.0:8080");
    }

    #[test]
    fn threshold_table_covers_tracked_metrics() {
        let table = Thresholds::default().table();
        assert_eq!(table.get(&MetricKind::CpuUsage), Some(&80.0));
        assert_eq!(table.get(&MetricKind::ServiceUp), Some(&1.0));
        assert!(table.get(&MetricKind::ErrorRate).is_none());
    }
}
