//! Provisioning request/result types and the built-in template registry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ResourceDescriptor;

/// User-initiated infrastructure creation, independent of any incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub requester: String,
    /// Natural-language description of the desired infrastructure.
    pub description: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Maximum acceptable monthly cost in USD.
    #[serde(default)]
    pub budget_limit: Option<f64>,
    /// When set, the document is filled from the template instead of the
    /// reasoning service. The validate/cost/apply pipeline is identical.
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_params: BTreeMap<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_region() -> String {
    "nyc3".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

/// Outcome of a provisioning request. Produced exactly once per request;
/// partial applies report what was created alongside the error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionResult {
    pub request_id: Uuid,
    pub success: bool,
    pub resources_created: Vec<ResourceDescriptor>,
    pub cost_estimate: Option<f64>,
    pub document: Option<String>,
    pub error: Option<String>,
    pub validation_errors: Vec<String>,
    pub logs: Vec<String>,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: f64,
}

/// A pre-built infrastructure template.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub required_params: &'static [&'static str],
    /// Parameter defaults merged under caller-supplied values.
    pub defaults: &'static [(&'static str, &'static str)],
    pub monthly_cost: f64,
    /// The document body with `${param}` placeholders.
    pub body: &'static str,
}

pub const BUILTIN_TEMPLATES: &[ProvisionTemplate] = &[
    ProvisionTemplate {
        id: "simple-droplet",
        name: "Simple Droplet",
        description: "Single Ubuntu droplet with a basic firewall (HTTP, HTTPS, SSH)",
        required_params: &["droplet_name"],
        defaults: &[
            ("size", "s-1vcpu-1gb"),
            ("region", "nyc3"),
            ("image", "ubuntu-22-04-x64"),
        ],
        monthly_cost: 6.0,
        body: r#"resource "droplet" "${droplet_name}" {
  name   = "${droplet_name}"
  size   = "${size}"
  region = "${region}"
  image  = "${image}"
}

resource "firewall" "${droplet_name}-fw" {
  name        = "${droplet_name}-fw"
  droplet     = droplet.${droplet_name}.id
  inbound     = ["22/tcp", "80/tcp", "443/tcp"]
}

output "droplet_id" {
  value = droplet.${droplet_name}.id
}
"#,
    },
    ProvisionTemplate {
        id: "postgres-db",
        name: "PostgreSQL Database",
        description: "Managed PostgreSQL cluster with automated backups",
        required_params: &["db_name"],
        defaults: &[
            ("engine", "pg"),
            ("engine_version", "16"),
            ("size", "db-s-1vcpu-1gb"),
            ("region", "nyc3"),
            ("node_count", "1"),
        ],
        monthly_cost: 15.0,
        body: r#"resource "database_cluster" "${db_name}" {
  name       = "${db_name}"
  engine     = "${engine}"
  version    = "${engine_version}"
  size       = "${size}"
  region     = "${region}"
  node_count = ${node_count}
}

output "database_id" {
  value = database_cluster.${db_name}.id
}
"#,
    },
    ProvisionTemplate {
        id: "redis-cache",
        name: "Redis Cache",
        description: "Managed Redis cluster for caching and session storage",
        required_params: &["db_name"],
        defaults: &[
            ("engine", "redis"),
            ("engine_version", "7"),
            ("size", "db-s-1vcpu-1gb"),
            ("region", "nyc3"),
            ("node_count", "1"),
        ],
        monthly_cost: 15.0,
        body: r#"resource "database_cluster" "${db_name}" {
  name       = "${db_name}"
  engine     = "${engine}"
  version    = "${engine_version}"
  size       = "${size}"
  region     = "${region}"
  node_count = ${node_count}
}

output "database_id" {
  value = database_cluster.${db_name}.id
}
"#,
    },
    ProvisionTemplate {
        id: "web-stack",
        name: "Complete Web Stack",
        description: "Load balancer, two app servers, and a PostgreSQL database",
        required_params: &["stack_name"],
        defaults: &[
            ("app_server_size", "s-2vcpu-4gb"),
            ("db_size", "db-s-1vcpu-1gb"),
            ("region", "nyc3"),
        ],
        monthly_cost: 45.0,
        body: r#"resource "droplet" "${stack_name}-app-1" {
  name   = "${stack_name}-app-1"
  size   = "${app_server_size}"
  region = "${region}"
}

resource "droplet" "${stack_name}-app-2" {
  name   = "${stack_name}-app-2"
  size   = "${app_server_size}"
  region = "${region}"
}

resource "load_balancer" "${stack_name}-lb" {
  name     = "${stack_name}-lb"
  region   = "${region}"
  droplets = [droplet.${stack_name}-app-1.id, droplet.${stack_name}-app-2.id]
}

resource "database_cluster" "${stack_name}-db" {
  name   = "${stack_name}-db"
  engine = "pg"
  size   = "${db_size}"
  region = "${region}"
}

output "lb_id" {
  value = load_balancer.${stack_name}-lb.id
}
"#,
    },
    ProvisionTemplate {
        id: "kubernetes-cluster",
        name: "Kubernetes Cluster",
        description: "Managed Kubernetes cluster with an auto-scaling node pool",
        required_params: &["cluster_name"],
        defaults: &[
            ("region", "nyc3"),
            ("node_size", "s-2vcpu-4gb"),
            ("node_count", "3"),
        ],
        monthly_cost: 36.0,
        body: r#"resource "kubernetes_cluster" "${cluster_name}" {
  name       = "${cluster_name}"
  region     = "${region}"
  node_size  = "${node_size}"
  node_count = ${node_count}
}

output "cluster_id" {
  value = kubernetes_cluster.${cluster_name}.id
}
"#,
    },
];

pub fn find_template(id: &str) -> Option<&'static ProvisionTemplate> {
    BUILTIN_TEMPLATES.iter().find(|t| t.id == id)
}

impl ProvisionTemplate {
    /// Fill the template body, merging defaults under the caller's params.
    /// Errors list the missing required parameters.
    pub fn render(
        &self,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<String, Vec<String>> {
        let missing: Vec<String> = self
            .required_params
            .iter()
            .filter(|p| !params.contains_key(**p))
            .map(|p| p.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }

        let mut merged: BTreeMap<&str, String> = self
            .defaults
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect();
        for (k, v) in params {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            merged.insert(k.as_str(), text);
        }

        let mut body = self.body.to_string();
        for (k, v) in &merged {
            body = body.replace(&format!("${{{k}}}"), v);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_render_fills_defaults_and_params() {
        let tpl = find_template("simple-droplet").unwrap();
        let mut params = BTreeMap::new();
        params.insert(
            "droplet_name".to_string(),
            serde_json::Value::String("test-box".to_string()),
        );
        let doc = tpl.render(&params).unwrap();
        assert!(doc.contains(r#"name   = "test-box""#));
        assert!(doc.contains(r#"size   = "s-1vcpu-1gb""#));
        assert!(!doc.contains("${"));
    }

    #[test]
    fn template_render_reports_missing_params() {
        let tpl = find_template("web-stack").unwrap();
        let err = tpl.render(&BTreeMap::new()).unwrap_err();
        assert_eq!(err, vec!["stack_name".to_string()]);
    }

    #[test]
    fn caller_params_override_defaults() {
        let tpl = find_template("simple-droplet").unwrap();
        let mut params = BTreeMap::new();
        params.insert("droplet_name".into(), serde_json::json!("big-box"));
        params.insert("size".into(), serde_json::json!("s-2vcpu-4gb"));
        let doc = tpl.render(&params).unwrap();
        assert!(doc.contains(r#"size   = "s-2vcpu-4gb""#));
    }

    #[test]
    fn builtin_registry_is_complete() {
        for id in [
            "simple-droplet",
            "postgres-db",
            "redis-cache",
            "web-stack",
            "kubernetes-cluster",
        ] {
            assert!(find_template(id).is_some(), "missing template {id}");
        }
        assert!(find_template("nope").is_none());
    }
}
