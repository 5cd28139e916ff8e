//! Remediation executor -- turns a diagnosis into an IaC change, applies it
//! through the runner, verifies recovery, and rolls back on failure.
//!
//! Per remediation the status machine is
//! `pending_approval -> applying -> verifying -> {succeeded | failed}`;
//! `failed` may move once to `rolled_back` when a prior-state snapshot was
//! captured, and `rejected` is the terminal human decision. Every transition
//! appends one ordered log line.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::iac::IacRunner;
use crate::clients::metrics::MetricsQuery;
use crate::clients::reasoning::Reasoning;
use crate::config::Verification;
use crate::model::{
    Diagnosis, Incident, IncidentStatus, MetricKind, Remediation, RemediationStatus,
    RootCauseCategory,
};
use crate::provision::{droplet_monthly_cost, estimate_document_cost, extract_iac_document};
use crate::safety::{ProposedAction, SafetyValidator};
use crate::storage::IncidentStore;

#[derive(Debug, Error)]
pub enum RemediateError {
    #[error("a remediation is already active for incident {0}")]
    Conflict(Uuid),
    #[error("incident {0} not found")]
    IncidentNotFound(Uuid),
    #[error("no diagnosis recorded for incident {0}")]
    NotDiagnosed(Uuid),
    #[error("remediation {0} not found")]
    RemediationNotFound(Uuid),
    #[error("remediation {0} is not awaiting approval")]
    NotPending(Uuid),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Definite outcome of the bounded verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Recovered,
    StillBreaching,
    TimedOut,
}

/// Droplet size ladder used for resize remediations.
const SIZE_LADDER: &[&str] = &[
    "s-1vcpu-1gb",
    "s-1vcpu-2gb",
    "s-2vcpu-2gb",
    "s-2vcpu-4gb",
    "s-4vcpu-8gb",
    "s-8vcpu-16gb",
];

/// Next size up from `current`, capped at the top of the ladder. Unknown
/// sizes start from the bottom.
pub fn next_size_up(current: &str) -> &'static str {
    match SIZE_LADDER.iter().position(|s| *s == current) {
        Some(i) if i + 1 < SIZE_LADDER.len() => SIZE_LADDER[i + 1],
        Some(_) => SIZE_LADDER[SIZE_LADDER.len() - 1],
        None => SIZE_LADDER[1],
    }
}

#[derive(Debug, Clone)]
pub struct CategoryPlan {
    pub document: String,
    pub summary: String,
    pub cost_delta: f64,
}

/// Deterministic IaC template keyed by root-cause category (and the breached
/// metric where it matters). `None` means the category has no template and
/// the reasoning service proposes the document instead.
pub fn render_category_plan(
    category: RootCauseCategory,
    incident: &Incident,
) -> Option<CategoryPlan> {
    let name = &incident.resource_name;
    let current_size = incident
        .metadata
        .get("resource_size")
        .and_then(|v| v.as_str())
        .unwrap_or("s-1vcpu-1gb")
        .to_string();

    match category {
        RootCauseCategory::UndersizedResource | RootCauseCategory::TrafficSpike => {
            if incident.metric == MetricKind::DiskUsage {
                let document = format!(
                    "resource \"volume\" \"{name}-data\" {{\n  name       = \"{name}-data\"\n  size_gb    = 100\n  droplet_id = \"{id}\"\n}}\n",
                    id = incident.resource_id,
                );
                return Some(CategoryPlan {
                    document,
                    summary: format!("Attach a 100GB volume to {name}"),
                    cost_delta: 100.0 * 0.10,
                });
            }
            let new_size = next_size_up(&current_size);
            let document = format!(
                "resource \"droplet\" \"{name}\" {{\n  name   = \"{name}\"\n  size   = \"{new_size}\"\n  resize = true\n}}\n",
            );
            Some(CategoryPlan {
                document,
                summary: format!("Resize {name} from {current_size} to {new_size}"),
                cost_delta: droplet_monthly_cost(new_size) - droplet_monthly_cost(&current_size),
            })
        }
        RootCauseCategory::RunawayProcess | RootCauseCategory::DependencyFailure => {
            let document = format!(
                "resource \"droplet_action\" \"{name}-restart\" {{\n  droplet_id = \"{id}\"\n  type       = \"power_cycle\"\n}}\n",
                id = incident.resource_id,
            );
            Some(CategoryPlan {
                document,
                summary: format!("Power-cycle {name} to clear the faulty process"),
                cost_delta: 0.0,
            })
        }
        RootCauseCategory::ConfigurationError => {
            let document = format!(
                "resource \"droplet\" \"{name}\" {{\n  name = \"{name}\"\n  size = \"{current_size}\"\n}}\n",
            );
            Some(CategoryPlan {
                document,
                summary: format!("Re-apply baseline configuration for {name}"),
                cost_delta: 0.0,
            })
        }
        RootCauseCategory::Unknown => None,
    }
}

pub struct RemediationExecutor {
    reasoning: Arc<dyn Reasoning>,
    iac: Arc<dyn IacRunner>,
    metrics: Arc<dyn MetricsQuery>,
    safety: SafetyValidator,
    store: IncidentStore,
    verification: Verification,
    /// Incident ids with a pipeline currently running in this process.
    inflight: Arc<Mutex<HashSet<Uuid>>>,
    /// Cancellation is honored only before apply commits.
    shutdown: Option<watch::Receiver<bool>>,
}

struct FlightGuard {
    set: Arc<Mutex<HashSet<Uuid>>>,
    id: Uuid,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

impl RemediationExecutor {
    pub fn new(
        reasoning: Arc<dyn Reasoning>,
        iac: Arc<dyn IacRunner>,
        metrics: Arc<dyn MetricsQuery>,
        safety: SafetyValidator,
        store: IncidentStore,
        verification: Verification,
    ) -> Self {
        Self {
            reasoning,
            iac,
            metrics,
            safety,
            store,
            verification,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    fn cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Claim the single-flight slot for an incident. A second remediation
    /// request while one is active is rejected, not queued.
    fn claim(&self, incident_id: Uuid) -> Result<FlightGuard, RemediateError> {
        let mut set = self
            .inflight
            .lock()
            .map_err(|_| RemediateError::Internal(anyhow::anyhow!("inflight lock poisoned")))?;
        if !set.insert(incident_id) {
            return Err(RemediateError::Conflict(incident_id));
        }
        Ok(FlightGuard {
            set: Arc::clone(&self.inflight),
            id: incident_id,
        })
    }

    /// Execute a remediation for a diagnosed incident. Stops in
    /// pending-approval when the safety gate requires a human and
    /// `auto_approve` was not requested.
    pub async fn execute(
        &self,
        incident_id: Uuid,
        auto_approve: bool,
    ) -> Result<Remediation, RemediateError> {
        let _guard = self.claim(incident_id)?;

        // A persisted non-terminal attempt also counts as active.
        if let Some(existing) = self
            .store
            .latest_remediation(incident_id)
            .map_err(RemediateError::Internal)?
        {
            if !existing.status.is_terminal() {
                return Err(RemediateError::Conflict(incident_id));
            }
        }

        let incident = self
            .store
            .get_incident(incident_id)
            .map_err(RemediateError::Internal)?
            .ok_or(RemediateError::IncidentNotFound(incident_id))?;
        let diagnosis = self
            .store
            .latest_diagnosis(incident_id)
            .map_err(RemediateError::Internal)?
            .ok_or(RemediateError::NotDiagnosed(incident_id))?;

        let started = Instant::now();
        let plan = self.build_plan(&incident, &diagnosis).await?;

        // Snapshot current state for rollback; a failed snapshot just means
        // no rollback path, which the safety gate weighs.
        let snapshot = match self.iac.show_state().await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(incident = %incident_id, error = %e, "state snapshot unavailable");
                None
            }
        };

        let action = ProposedAction::new(plan.document.clone(), plan.cost_delta, snapshot.is_some());
        let report = self.safety.validate(&action);

        let mut remediation = Remediation::new(
            incident_id,
            plan.document,
            plan.summary,
            plan.cost_delta,
            report.risk,
            report.requires_approval,
        );
        remediation.logs.push(format!(
            "created: {} (risk {}, cost delta ${:.2}/month)",
            remediation.action_summary,
            report.risk.as_str(),
            remediation.cost_delta
        ));
        for reason in &report.reasons {
            remediation.logs.push(format!("safety: {reason}"));
        }
        self.store
            .insert_remediation(&remediation)
            .map_err(RemediateError::Internal)?;

        if report.requires_approval && !auto_approve {
            remediation
                .logs
                .push("pending_approval: awaiting human decision".to_string());
            remediation.duration_secs = started.elapsed().as_secs_f64();
            self.store
                .update_remediation(&remediation)
                .map_err(RemediateError::Internal)?;
            info!(
                incident = %incident_id,
                remediation = %remediation.id,
                "remediation held for approval"
            );
            return Ok(remediation);
        }

        self.run_pipeline(remediation, &incident, snapshot, started)
            .await
            .map_err(RemediateError::Internal)
    }

    /// Resolve a pending-approval remediation. Approval resumes the
    /// pipeline; rejection is terminal and leaves the incident diagnosed.
    pub async fn decide(
        &self,
        remediation_id: Uuid,
        approve: bool,
    ) -> Result<Remediation, RemediateError> {
        let mut remediation = self
            .store
            .get_remediation(remediation_id)
            .map_err(RemediateError::Internal)?
            .ok_or(RemediateError::RemediationNotFound(remediation_id))?;
        if remediation.status != RemediationStatus::PendingApproval {
            return Err(RemediateError::NotPending(remediation_id));
        }

        if !approve {
            remediation.status = RemediationStatus::Rejected;
            remediation
                .logs
                .push("rejected: human declined the plan".to_string());
            self.store
                .update_remediation(&remediation)
                .map_err(RemediateError::Internal)?;
            info!(remediation = %remediation_id, "remediation rejected");
            return Ok(remediation);
        }

        let _guard = self.claim(remediation.incident_id)?;
        let incident = self
            .store
            .get_incident(remediation.incident_id)
            .map_err(RemediateError::Internal)?
            .ok_or(RemediateError::IncidentNotFound(remediation.incident_id))?;

        remediation
            .logs
            .push("approved: human cleared the plan".to_string());
        let snapshot = self.iac.show_state().await.ok();
        let started = Instant::now();
        self.run_pipeline(remediation, &incident, snapshot, started)
            .await
            .map_err(RemediateError::Internal)
    }

    async fn build_plan(
        &self,
        incident: &Incident,
        diagnosis: &Diagnosis,
    ) -> Result<CategoryPlan, RemediateError> {
        if let Some(plan) = render_category_plan(diagnosis.category, incident) {
            return Ok(plan);
        }

        // No template for this category: ask the reasoning service, treat
        // the answer as untrusted and re-derive the cost ourselves.
        let prompt = format!(
            "Propose an infrastructure-as-code change to remediate this incident.\n\
             Root cause: {}\n\
             Resource: {} ({})\n\
             Metric: {} = {:.2} (threshold {:.2})\n\
             Return ONLY the configuration document.",
            diagnosis.root_cause,
            incident.resource_name,
            incident.resource_kind.as_str(),
            incident.metric.as_str(),
            incident.current_value,
            incident.threshold_value,
        );
        let generation = self
            .reasoning
            .complete(&prompt)
            .await
            .map_err(|e| RemediateError::Internal(anyhow::anyhow!("plan generation failed: {e}")))?;
        let document = extract_iac_document(&generation.text);
        if document.trim().is_empty() {
            return Err(RemediateError::Internal(anyhow::anyhow!(
                "reasoning service returned no usable document"
            )));
        }
        let cost_delta = estimate_document_cost(&document);
        Ok(CategoryPlan {
            document,
            summary: format!("Apply generated fix for: {}", diagnosis.root_cause),
            cost_delta,
        })
    }

    /// The applying -> verifying -> terminal stretch of the state machine.
    async fn run_pipeline(
        &self,
        mut remediation: Remediation,
        incident: &Incident,
        snapshot: Option<serde_json::Value>,
        started: Instant,
    ) -> Result<Remediation> {
        self.store
            .set_incident_status(incident.id, IncidentStatus::Remediating)?;

        remediation.status = RemediationStatus::Applying;
        remediation
            .logs
            .push("applying: validating document".to_string());
        self.store.update_remediation(&remediation)?;

        match self.iac.validate(&remediation.document).await {
            Ok(validation) if validation.valid => {
                remediation.logs.push("applying: document valid".to_string());
            }
            Ok(validation) => {
                let detail = validation.errors.join("; ");
                return self
                    .finish_failed(remediation, incident, None, started, &detail)
                    .await;
            }
            Err(e) => {
                return self
                    .finish_failed(remediation, incident, None, started, &e.to_string())
                    .await;
            }
        }

        match self.iac.plan(&remediation.document).await {
            Ok(plan) if plan.success => {
                remediation.logs.push(format!(
                    "applying: plan {} to add, {} to change, {} to destroy",
                    plan.to_add, plan.to_change, plan.to_destroy
                ));
            }
            Ok(plan) => {
                return self
                    .finish_failed(remediation, incident, None, started, &plan.output)
                    .await;
            }
            Err(e) => {
                return self
                    .finish_failed(remediation, incident, None, started, &e.to_string())
                    .await;
            }
        }

        // Last cancellation point: once apply starts, the executor runs to a
        // terminal state so infrastructure is never left half-changed.
        if self.cancelled() {
            return self
                .finish_failed(remediation, incident, None, started, "cancelled before apply")
                .await;
        }

        remediation.logs.push("applying: apply started".to_string());
        self.store.update_remediation(&remediation)?;

        match self.iac.apply(&remediation.document).await {
            Ok(apply) if apply.success => {
                remediation.logs.push("applying: apply complete".to_string());
            }
            Ok(apply) => {
                let detail = apply.error.unwrap_or_else(|| "apply failed".to_string());
                return self
                    .finish_failed(remediation, incident, snapshot, started, &detail)
                    .await;
            }
            Err(e) => {
                return self
                    .finish_failed(remediation, incident, snapshot, started, &e.to_string())
                    .await;
            }
        }

        remediation.status = RemediationStatus::Verifying;
        remediation.logs.push(format!(
            "verifying: polling {} for up to {}s",
            incident.metric.as_str(),
            self.verification.deadline_secs
        ));
        self.store.update_remediation(&remediation)?;

        match self.verify_recovery(incident).await {
            VerifyOutcome::Recovered => {
                remediation.status = RemediationStatus::Succeeded;
                remediation.verification_passed = true;
                remediation
                    .logs
                    .push("succeeded: metric back under threshold".to_string());
                remediation.duration_secs = started.elapsed().as_secs_f64();
                self.store.update_remediation(&remediation)?;
                self.store
                    .set_incident_status(incident.id, IncidentStatus::Resolved)?;
                info!(
                    incident = %incident.id,
                    remediation = %remediation.id,
                    "remediation succeeded"
                );
                Ok(remediation)
            }
            outcome => {
                let detail = match outcome {
                    VerifyOutcome::StillBreaching => "metric still breaching at deadline",
                    _ => "no healthy sample before deadline",
                };
                self.finish_failed(remediation, incident, snapshot, started, detail)
                    .await
            }
        }
    }

    /// Terminal failure handling: record failed, then attempt rollback when
    /// a snapshot exists. A successful rollback moves the record to
    /// rolled_back and returns the incident to detected; the original
    /// attempt stays recorded as failed in the error field either way.
    async fn finish_failed(
        &self,
        mut remediation: Remediation,
        incident: &Incident,
        snapshot: Option<serde_json::Value>,
        started: Instant,
        detail: &str,
    ) -> Result<Remediation> {
        warn!(
            incident = %incident.id,
            remediation = %remediation.id,
            detail,
            "remediation failed"
        );
        remediation.status = RemediationStatus::Failed;
        remediation.error = Some(detail.to_string());
        remediation.logs.push(format!("failed: {detail}"));

        let mut rolled_back = false;
        if let Some(state) = snapshot {
            remediation
                .logs
                .push("rollback: restoring prior state".to_string());
            match self.iac.restore(&state).await {
                Ok(outcome) if outcome.success => {
                    rolled_back = true;
                    remediation.rollback_executed = true;
                    remediation.status = RemediationStatus::RolledBack;
                    remediation
                        .logs
                        .push("rolled_back: prior state restored".to_string());
                }
                Ok(outcome) => {
                    let e = outcome.error.unwrap_or_else(|| "restore failed".to_string());
                    remediation.logs.push(format!("rollback failed: {e}"));
                }
                Err(e) => {
                    remediation.logs.push(format!("rollback failed: {e}"));
                }
            }
        } else {
            remediation
                .logs
                .push("rollback: no snapshot available".to_string());
        }

        remediation.duration_secs = started.elapsed().as_secs_f64();
        self.store.update_remediation(&remediation)?;

        if rolled_back {
            // Infrastructure is back to its prior state; the incident is
            // unresolved and eligible for a fresh pass.
            self.store
                .set_incident_status(incident.id, IncidentStatus::Detected)?;
        } else {
            self.store
                .set_incident_status(incident.id, IncidentStatus::Failed)?;
        }
        Ok(remediation)
    }

    /// Bounded verification: poll the triggering metric until it recovers
    /// or the deadline passes. Always returns a definite outcome.
    async fn verify_recovery(&self, incident: &Incident) -> VerifyOutcome {
        let deadline = Instant::now() + std::time::Duration::from_secs(self.verification.deadline_secs);
        let poll = std::time::Duration::from_secs(self.verification.poll_interval_secs.max(1));
        let mut last_seen: Option<f64> = None;

        loop {
            match self
                .metrics
                .instant(&incident.resource_id, incident.metric)
                .await
            {
                Ok(Some(value)) => {
                    last_seen = Some(value);
                    let recovered = if incident.metric == MetricKind::ServiceUp {
                        value >= incident.threshold_value
                    } else {
                        value < incident.threshold_value
                    };
                    if recovered {
                        return VerifyOutcome::Recovered;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(incident = %incident.id, error = %e, "verification poll failed");
                }
            }

            if Instant::now() + poll > deadline {
                return match last_seen {
                    Some(_) => VerifyOutcome::StillBreaching,
                    None => VerifyOutcome::TimedOut,
                };
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceKind, Severity};

    fn incident_with(metric: MetricKind, size: &str) -> Incident {
        let mut incident = Incident::new(
            "droplet-1",
            "web-app",
            ResourceKind::Droplet,
            metric,
            95.0,
            80.0,
            Severity::Critical,
        );
        incident.metadata = serde_json::json!({ "resource_size": size });
        incident
    }

    #[test]
    fn size_ladder_steps_up_and_caps() {
        assert_eq!(next_size_up("s-1vcpu-1gb"), "s-1vcpu-2gb");
        assert_eq!(next_size_up("s-4vcpu-8gb"), "s-8vcpu-16gb");
        assert_eq!(next_size_up("s-8vcpu-16gb"), "s-8vcpu-16gb");
        assert_eq!(next_size_up("weird-size"), "s-1vcpu-2gb");
    }

    #[test]
    fn undersized_cpu_incident_renders_resize() {
        let incident = incident_with(MetricKind::CpuUsage, "s-1vcpu-1gb");
        let plan =
            render_category_plan(RootCauseCategory::UndersizedResource, &incident).unwrap();
        assert!(plan.document.contains("s-1vcpu-2gb"));
        assert!(plan.summary.contains("Resize web-app"));
        // $12 - $6
        assert!((plan.cost_delta - 6.0).abs() < 1e-9);
    }

    #[test]
    fn undersized_disk_incident_renders_volume_attach() {
        let incident = incident_with(MetricKind::DiskUsage, "s-1vcpu-1gb");
        let plan =
            render_category_plan(RootCauseCategory::UndersizedResource, &incident).unwrap();
        assert!(plan.document.contains("volume"));
        assert!((plan.cost_delta - 10.0).abs() < 1e-9);
    }

    #[test]
    fn runaway_process_renders_power_cycle_at_zero_cost() {
        let incident = incident_with(MetricKind::CpuUsage, "s-2vcpu-2gb");
        let plan = render_category_plan(RootCauseCategory::RunawayProcess, &incident).unwrap();
        assert!(plan.document.contains("power_cycle"));
        assert_eq!(plan.cost_delta, 0.0);
    }

    #[test]
    fn unknown_category_has_no_template() {
        let incident = incident_with(MetricKind::CpuUsage, "s-1vcpu-1gb");
        assert!(render_category_plan(RootCauseCategory::Unknown, &incident).is_none());
    }

    #[test]
    fn category_templates_never_contain_destructive_verbs() {
        let incident = incident_with(MetricKind::CpuUsage, "s-1vcpu-1gb");
        for category in [
            RootCauseCategory::UndersizedResource,
            RootCauseCategory::RunawayProcess,
            RootCauseCategory::TrafficSpike,
            RootCauseCategory::ConfigurationError,
            RootCauseCategory::DependencyFailure,
        ] {
            if let Some(plan) = render_category_plan(category, &incident) {
                assert!(
                    crate::safety::inspect_verbs(&plan.document).is_empty(),
                    "template for {category:?} tripped the destructive-verb check"
                );
            }
        }
    }
}
