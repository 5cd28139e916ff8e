//! Provisioner -- natural-language or template requests through the shared
//! validate / cost / safety / apply pipeline.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::clients::iac::{descriptors_from_outputs, IacRunner};
use crate::clients::reasoning::Reasoning;
use crate::model::provision::{find_template, ProvisionRequest, ProvisionResult};
use crate::safety::{ProposedAction, SafetyValidator};
use crate::storage::IncidentStore;

/// Monthly droplet pricing by size slug. Unknown sizes assume the mid tier.
pub fn droplet_monthly_cost(size: &str) -> f64 {
    match size {
        "s-1vcpu-1gb" => 6.0,
        "s-1vcpu-2gb" => 12.0,
        "s-2vcpu-2gb" => 18.0,
        "s-2vcpu-4gb" => 24.0,
        "s-4vcpu-8gb" => 48.0,
        "s-8vcpu-16gb" => 96.0,
        _ => 12.0,
    }
}

/// Monthly managed-database pricing by size slug.
pub fn database_monthly_cost(size: &str) -> f64 {
    match size {
        "db-s-1vcpu-1gb" => 15.0,
        "db-s-1vcpu-2gb" => 30.0,
        "db-s-2vcpu-4gb" => 60.0,
        "db-s-4vcpu-8gb" => 120.0,
        _ => 15.0,
    }
}

const LOAD_BALANCER_MONTHLY_COST: f64 = 12.0;
const VOLUME_COST_PER_GB: f64 = 0.10;

fn quoted_value(rest: &str) -> Option<&str> {
    let start = rest.find('"')? + 1;
    let end = start + rest[start..].find('"')?;
    Some(&rest[start..end])
}

/// Estimate the monthly cost of a document by summing known per-resource
/// prices: droplet and database size slugs, $12 per load balancer, and
/// $0.10/GB for volumes.
pub fn estimate_document_cost(document: &str) -> f64 {
    let mut cost = 0.0;
    let mut in_volume_block = false;

    for raw in document.lines() {
        let line = raw.trim();

        if let Some(rest) = line.strip_prefix("resource") {
            let kind = quoted_value(rest).unwrap_or("");
            in_volume_block = kind.contains("volume");
            if kind.contains("load_balancer") || kind.contains("loadbalancer") {
                cost += LOAD_BALANCER_MONTHLY_COST;
            }
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key == "size_gb" {
            if let Ok(gb) = value.trim_end_matches(',').parse::<f64>() {
                cost += gb * VOLUME_COST_PER_GB;
            }
        } else if key == "size" {
            if let Some(slug) = quoted_value(value) {
                if slug.starts_with("db-") {
                    cost += database_monthly_cost(slug);
                } else if slug.starts_with("s-") {
                    cost += droplet_monthly_cost(slug);
                }
            } else if in_volume_block {
                if let Ok(gb) = value.trim_end_matches(',').parse::<f64>() {
                    cost += gb * VOLUME_COST_PER_GB;
                }
            }
        }
    }
    cost
}

/// Extract the configuration document from reasoning output, stripping any
/// markdown fences. Empty when nothing document-shaped is present.
pub fn extract_iac_document(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.contains("```") {
        for part in trimmed.split("```") {
            let part = part.trim();
            // Strip a fence language tag, but only a tag on its own line so
            // a document starting with `terraform {` stays intact.
            let body = ["hcl\n", "terraform\n", "tf\n"]
                .iter()
                .find_map(|tag| part.strip_prefix(tag))
                .unwrap_or(part)
                .trim();
            if body.contains("resource \"") || body.contains("terraform {") {
                return body.to_string();
            }
        }
        return String::new();
    }

    if trimmed.contains("resource \"") || trimmed.contains("terraform {") {
        trimmed.to_string()
    } else {
        String::new()
    }
}

pub struct Provisioner {
    reasoning: Arc<dyn Reasoning>,
    iac: Arc<dyn IacRunner>,
    safety: SafetyValidator,
    store: IncidentStore,
}

impl Provisioner {
    pub fn new(
        reasoning: Arc<dyn Reasoning>,
        iac: Arc<dyn IacRunner>,
        safety: SafetyValidator,
        store: IncidentStore,
    ) -> Self {
        Self {
            reasoning,
            iac,
            safety,
            store,
        }
    }

    /// Run one provisioning request to a definite result. Failures come back
    /// as `success = false` with structured reasons; a partial apply reports
    /// the resources that were created before the error.
    pub async fn provision(&self, request: &ProvisionRequest) -> ProvisionResult {
        let started = Instant::now();
        let mut logs = vec![format!("provisioning request {}", request.id)];
        info!(request = %request.id, template = ?request.template_id, "provisioning started");

        // 1. Obtain the document: template fill or reasoning generation.
        // Both paths go through the identical validate/cost/apply pipeline.
        let (document, template_cost) = match &request.template_id {
            Some(template_id) => {
                let Some(template) = find_template(template_id) else {
                    return self.fail(
                        request,
                        format!("unknown template '{template_id}'"),
                        Vec::new(),
                        None,
                        logs,
                        started,
                    );
                };
                logs.push(format!("using template: {}", template.name));
                match template.render(&request.template_params) {
                    Ok(doc) => (doc, Some(template.monthly_cost)),
                    Err(missing) => {
                        return self.fail(
                            request,
                            format!("missing required parameters: {}", missing.join(", ")),
                            missing,
                            None,
                            logs,
                            started,
                        );
                    }
                }
            }
            None => {
                logs.push("generating document from description".to_string());
                let prompt = build_generation_prompt(request);
                match self.reasoning.complete(&prompt).await {
                    Ok(generation) => {
                        let document = extract_iac_document(&generation.text);
                        if document.is_empty() {
                            return self.fail(
                                request,
                                "reasoning service returned no usable document".to_string(),
                                Vec::new(),
                                None,
                                logs,
                                started,
                            );
                        }
                        (document, None)
                    }
                    Err(e) => {
                        return self.fail(
                            request,
                            format!("document generation failed: {e}"),
                            Vec::new(),
                            None,
                            logs,
                            started,
                        );
                    }
                }
            }
        };
        logs.push(format!("document ready ({} bytes)", document.len()));

        // 2. Cost estimate: template registry price, or summed per-resource
        // prices parsed from the document. Never taken from the reasoning
        // service.
        let cost = template_cost.unwrap_or_else(|| estimate_document_cost(&document));
        logs.push(format!("estimated monthly cost: ${cost:.2}"));

        if let Some(budget) = request.budget_limit {
            if cost > budget {
                return self.fail(
                    request,
                    format!("cost estimate ${cost:.2} exceeds budget limit ${budget:.2}"),
                    Vec::new(),
                    Some(document),
                    logs,
                    started,
                );
            }
        }

        // 3. The shared safety gate. Provisioning can require approval on
        // cost grounds just like remediation.
        let rollback_possible = self.iac.show_state().await.is_ok();
        let action = ProposedAction::new(document.clone(), cost, rollback_possible);
        let report = self.safety.validate(&action);
        if report.requires_approval {
            for reason in &report.reasons {
                logs.push(format!("safety: {reason}"));
            }
            return self.fail(
                request,
                format!(
                    "requires human approval (risk {}): {}",
                    report.risk.as_str(),
                    report.reasons.join("; ")
                ),
                Vec::new(),
                Some(document),
                logs,
                started,
            );
        }
        logs.push("safety checks passed".to_string());

        // 4. Runner validation. A rejection is terminal, nothing is applied.
        match self.iac.validate(&document).await {
            Ok(validation) if validation.valid => {
                logs.push("document valid".to_string());
                for w in validation.warnings {
                    logs.push(format!("warning: {w}"));
                }
            }
            Ok(validation) => {
                return self.fail(
                    request,
                    format!("validation failed: {}", validation.errors.join("; ")),
                    validation.errors,
                    Some(document),
                    logs,
                    started,
                );
            }
            Err(e) => {
                return self.fail(
                    request,
                    format!("validation error: {e}"),
                    Vec::new(),
                    Some(document),
                    logs,
                    started,
                );
            }
        }

        // 5. Apply and collect created resources. A mid-apply failure still
        // reports what was created.
        logs.push("applying document".to_string());
        let result = match self.iac.apply(&document).await {
            Ok(outcome) => {
                let mut resources = outcome.resources_created.clone();
                if resources.is_empty() {
                    resources = descriptors_from_outputs(&outcome.outputs);
                }
                if outcome.success {
                    logs.push(format!("created {} resource(s)", resources.len()));
                    ProvisionResult {
                        request_id: request.id,
                        success: true,
                        resources_created: resources,
                        cost_estimate: Some(cost),
                        document: Some(document),
                        error: None,
                        validation_errors: Vec::new(),
                        logs,
                        completed_at: Utc::now(),
                        duration_secs: started.elapsed().as_secs_f64(),
                    }
                } else {
                    let error = outcome
                        .error
                        .unwrap_or_else(|| "apply failed".to_string());
                    logs.push(format!(
                        "apply failed with {} resource(s) already created: {error}",
                        resources.len()
                    ));
                    ProvisionResult {
                        request_id: request.id,
                        success: false,
                        resources_created: resources,
                        cost_estimate: Some(cost),
                        document: Some(document),
                        error: Some(error),
                        validation_errors: Vec::new(),
                        logs,
                        completed_at: Utc::now(),
                        duration_secs: started.elapsed().as_secs_f64(),
                    }
                }
            }
            Err(e) => {
                logs.push(format!("apply error: {e}"));
                ProvisionResult {
                    request_id: request.id,
                    success: false,
                    resources_created: Vec::new(),
                    cost_estimate: Some(cost),
                    document: Some(document),
                    error: Some(e.to_string()),
                    validation_errors: Vec::new(),
                    logs,
                    completed_at: Utc::now(),
                    duration_secs: started.elapsed().as_secs_f64(),
                }
            }
        };

        self.persist(request, &result);
        info!(
            request = %request.id,
            success = result.success,
            resources = result.resources_created.len(),
            "provisioning finished"
        );
        result
    }

    fn fail(
        &self,
        request: &ProvisionRequest,
        error: String,
        validation_errors: Vec<String>,
        document: Option<String>,
        mut logs: Vec<String>,
        started: Instant,
    ) -> ProvisionResult {
        warn!(request = %request.id, %error, "provisioning failed");
        logs.push(format!("failed: {error}"));
        let result = ProvisionResult {
            request_id: request.id,
            success: false,
            resources_created: Vec::new(),
            cost_estimate: None,
            document,
            error: Some(error),
            validation_errors,
            logs,
            completed_at: Utc::now(),
            duration_secs: started.elapsed().as_secs_f64(),
        };
        self.persist(request, &result);
        result
    }

    fn persist(&self, request: &ProvisionRequest, result: &ProvisionResult) {
        if let Err(e) =
            self.store
                .insert_provision_result(&request.requester, &request.description, result)
        {
            warn!(request = %request.id, error = %e, "failed to persist provision result");
        }
    }
}

fn build_generation_prompt(request: &ProvisionRequest) -> String {
    format!(
        "You are an infrastructure engineer. Generate a complete declarative\n\
         configuration document for this request:\n\
         \n\
         Request: {}\n\
         Region: {}\n\
         Environment: {}\n\
         Budget limit: {}\n\
         \n\
         Rules:\n\
         - Use resource blocks with explicit size slugs (e.g. \"s-1vcpu-1gb\").\n\
         - Emit outputs for every created resource id (droplet_id, database_id, ...).\n\
         - Return ONLY the configuration document, no explanations.",
        request.description,
        request.region,
        request.environment,
        request
            .budget_limit
            .map(|b| format!("${b:.2}/month"))
            .unwrap_or_else(|| "unlimited".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_cost_sums_known_resource_prices() {
        let document = r#"
resource "droplet" "web" {
  size = "s-2vcpu-4gb"
}

resource "database_cluster" "db" {
  size = "db-s-1vcpu-1gb"
}

resource "load_balancer" "lb" {
  region = "nyc3"
}

resource "volume" "data" {
  size_gb = 100
}
"#;
        // 24 + 15 + 12 + 10
        assert!((estimate_document_cost(document) - 61.0).abs() < 1e-9);
    }

    #[test]
    fn smallest_droplet_costs_six() {
        let document = "resource \"droplet\" \"t\" {\n  size = \"s-1vcpu-1gb\"\n}\n";
        assert!((estimate_document_cost(document) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_document_costs_nothing() {
        assert_eq!(estimate_document_cost("just some text"), 0.0);
    }

    #[test]
    fn extract_strips_markdown_fences() {
        let text = "Here you go:\n```hcl\nresource \"droplet\" \"x\" {\n  size = \"s-1vcpu-1gb\"\n}\n```\nLet me know!";
        let document = extract_iac_document(text);
        assert!(document.starts_with("resource"));
        assert!(!document.contains("```"));
        assert!(!document.contains("Let me know"));
    }

    #[test]
    fn extract_accepts_bare_documents() {
        let text = "resource \"droplet\" \"x\" {\n  size = \"s-1vcpu-1gb\"\n}\n";
        assert_eq!(extract_iac_document(text), text.trim());
    }

    #[test]
    fn extract_rejects_prose() {
        assert_eq!(extract_iac_document("I cannot help with that."), "");
        assert_eq!(extract_iac_document(""), "");
    }

    #[test]
    fn pricing_tables_cover_the_ladder() {
        assert_eq!(droplet_monthly_cost("s-1vcpu-1gb"), 6.0);
        assert_eq!(droplet_monthly_cost("s-8vcpu-16gb"), 96.0);
        assert_eq!(droplet_monthly_cost("mystery"), 12.0);
        assert_eq!(database_monthly_cost("db-s-2vcpu-4gb"), 60.0);
        assert_eq!(database_monthly_cost("mystery"), 15.0);
    }
}
