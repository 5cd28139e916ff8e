//! IaC runner -- validate / plan / apply / show-state over a declarative
//! configuration document, plus restore for rollback.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use super::ClientError;
use crate::model::{ResourceDescriptor, ResourceKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IacValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IacPlanSummary {
    pub success: bool,
    pub to_add: u32,
    pub to_change: u32,
    pub to_destroy: u32,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IacApplyOutcome {
    pub success: bool,
    /// Resources that exist after the apply, including ones created before
    /// a mid-apply failure. Partial applies are reported, never dropped.
    pub resources_created: Vec<ResourceDescriptor>,
    pub resources_updated: u32,
    pub resources_destroyed: u32,
    pub outputs: serde_json::Value,
    pub error: Option<String>,
}

#[async_trait]
pub trait IacRunner: Send + Sync {
    async fn validate(&self, document: &str) -> Result<IacValidation, ClientError>;
    async fn plan(&self, document: &str) -> Result<IacPlanSummary, ClientError>;
    async fn apply(&self, document: &str) -> Result<IacApplyOutcome, ClientError>;
    /// Snapshot of the current managed state, usable for [`IacRunner::restore`].
    async fn show_state(&self) -> Result<serde_json::Value, ClientError>;
    /// Re-apply a previously captured state snapshot.
    async fn restore(&self, state: &serde_json::Value) -> Result<IacApplyOutcome, ClientError>;
}

/// Derive created-resource descriptors from runner output values, tagging
/// kinds from well-known output keys with a generic fallback.
pub fn descriptors_from_outputs(outputs: &serde_json::Value) -> Vec<ResourceDescriptor> {
    let mut found = Vec::new();
    let Some(map) = outputs.as_object() else {
        return found;
    };

    // `output -json` wraps each value in {"value": ...}; accept both forms.
    let as_text = |v: &serde_json::Value| {
        let v = v.get("value").unwrap_or(v);
        match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    };
    let name_for = |stem: &str| {
        map.get(&format!("{stem}_name"))
            .map(as_text)
            .or_else(|| map.get("name").map(as_text))
    };

    for (key, value) in map {
        let Some(stem) = key.strip_suffix("_id") else {
            continue;
        };
        let kind = match stem {
            "droplet" => ResourceKind::Droplet,
            "database" => ResourceKind::Database,
            "cluster" | "kubernetes" => ResourceKind::Kubernetes,
            "lb" | "load_balancer" => ResourceKind::LoadBalancer,
            "volume" => ResourceKind::Volume,
            "firewall" => ResourceKind::Firewall,
            "vpc" => ResourceKind::Vpc,
            _ => ResourceKind::Unknown,
        };
        let id = as_text(value);
        let name = name_for(stem).unwrap_or_else(|| format!("{stem}-{id}"));
        found.push(ResourceDescriptor { id, name, kind });
    }
    found
}

/// Runs a terraform-compatible binary in a scratch working directory.
pub struct CommandIacRunner {
    binary: String,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandIacRunner {
    pub fn new(binary: &str, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            workdir: workdir.into(),
            timeout,
        }
    }

    async fn write_document(&self, document: &str) -> Result<(), ClientError> {
        tokio::fs::create_dir_all(&self.workdir)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        tokio::fs::write(self.workdir.join("main.tf"), document)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn run(&self, args: &[&str]) -> Result<(bool, String), ClientError> {
        debug!(binary = %self.binary, ?args, "running iac command");
        let child = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.workdir)
            .output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            text.push('\n');
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Ok((output.status.success(), text))
    }

    /// Parse "Plan: 2 to add, 1 to change, 0 to destroy." style summaries.
    fn parse_plan_counts(output: &str) -> (u32, u32, u32) {
        for line in output.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Plan:") {
                let mut add = 0;
                let mut change = 0;
                let mut destroy = 0;
                for part in rest.split(',') {
                    let mut words = part.split_whitespace();
                    let n: u32 = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                    let rest: Vec<&str> = words.collect();
                    let tail = rest.join(" ");
                    if tail.starts_with("to add") {
                        add = n;
                    } else if tail.starts_with("to change") {
                        change = n;
                    } else if tail.starts_with("to destroy") {
                        destroy = n;
                    }
                }
                return (add, change, destroy);
            }
        }
        (0, 0, 0)
    }

    async fn read_outputs(&self) -> serde_json::Value {
        match self.run(&["output", "-json"]).await {
            Ok((true, text)) => {
                serde_json::from_str(&text).unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }
}

#[async_trait]
impl IacRunner for CommandIacRunner {
    async fn validate(&self, document: &str) -> Result<IacValidation, ClientError> {
        self.write_document(document).await?;
        let (ok, text) = self.run(&["validate", "-no-color"]).await?;
        let errors = if ok {
            Vec::new()
        } else {
            text.lines()
                .filter(|l| l.contains("Error"))
                .map(str::to_string)
                .collect()
        };
        Ok(IacValidation {
            valid: ok,
            errors: if !ok && errors.is_empty() {
                vec![text.trim().to_string()]
            } else {
                errors
            },
            warnings: text
                .lines()
                .filter(|l| l.contains("Warning"))
                .map(str::to_string)
                .collect(),
        })
    }

    async fn plan(&self, document: &str) -> Result<IacPlanSummary, ClientError> {
        self.write_document(document).await?;
        let (ok, text) = self.run(&["plan", "-no-color", "-input=false"]).await?;
        let (to_add, to_change, to_destroy) = Self::parse_plan_counts(&text);
        Ok(IacPlanSummary {
            success: ok,
            to_add,
            to_change,
            to_destroy,
            output: text,
        })
    }

    async fn apply(&self, document: &str) -> Result<IacApplyOutcome, ClientError> {
        self.write_document(document).await?;
        let (ok, text) = self
            .run(&["apply", "-no-color", "-input=false", "-auto-approve"])
            .await?;
        let outputs = self.read_outputs().await;
        let resources_created = descriptors_from_outputs(&outputs);
        if !ok {
            warn!("iac apply failed");
        }
        Ok(IacApplyOutcome {
            success: ok,
            resources_created,
            resources_updated: 0,
            resources_destroyed: 0,
            outputs,
            error: if ok { None } else { Some(text.trim().to_string()) },
        })
    }

    async fn show_state(&self) -> Result<serde_json::Value, ClientError> {
        let (ok, text) = self.run(&["show", "-json"]).await?;
        if !ok {
            return Err(ClientError::Transport(text.trim().to_string()));
        }
        serde_json::from_str(&text).map_err(|e| ClientError::Malformed(e.to_string()))
    }

    async fn restore(&self, state: &serde_json::Value) -> Result<IacApplyOutcome, ClientError> {
        let path = self.workdir.join("rollback.tfstate");
        let payload = serde_json::to_string_pretty(state)
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (ok, text) = self
            .run(&[
                "apply",
                "-no-color",
                "-input=false",
                "-auto-approve",
                "-state=rollback.tfstate",
            ])
            .await?;
        Ok(IacApplyOutcome {
            success: ok,
            resources_created: Vec::new(),
            resources_updated: 0,
            resources_destroyed: 0,
            outputs: serde_json::Value::Null,
            error: if ok { None } else { Some(text.trim().to_string()) },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_counts_parse() {
        let out = "random noise\nPlan: 2 to add, 1 to change, 0 to destroy.\n";
        assert_eq!(CommandIacRunner::parse_plan_counts(out), (2, 1, 0));
        assert_eq!(CommandIacRunner::parse_plan_counts("no plan line"), (0, 0, 0));
    }

    #[test]
    fn descriptors_tagged_from_output_keys() {
        let outputs = serde_json::json!({
            "droplet_id": "1234",
            "droplet_name": "web-app",
            "database_id": "db-9",
            "ipv4_address": "10.0.0.1",
        });
        let mut got = descriptors_from_outputs(&outputs);
        got.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].kind, ResourceKind::Droplet);
        assert_eq!(got[0].name, "web-app");
        assert_eq!(got[1].kind, ResourceKind::Database);
        assert_eq!(got[1].name, "database-db-9");
    }

    #[test]
    fn descriptors_ignore_non_object_outputs() {
        assert!(descriptors_from_outputs(&serde_json::Value::Null).is_empty());
    }
}
