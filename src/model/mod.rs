//! Core data model -- incidents, diagnoses, remediations.

pub mod provision;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Incident severity, derived once at creation and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Severity {
        match s {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

/// Incident lifecycle status. Only moves forward, except the explicit
/// rollback-to-detected transition after a rolled-back remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Detected,
    Diagnosing,
    Diagnosed,
    Remediating,
    Resolved,
    Failed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Detected => "detected",
            IncidentStatus::Diagnosing => "diagnosing",
            IncidentStatus::Diagnosed => "diagnosed",
            IncidentStatus::Remediating => "remediating",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> IncidentStatus {
        match s {
            "diagnosing" => IncidentStatus::Diagnosing,
            "diagnosed" => IncidentStatus::Diagnosed,
            "remediating" => IncidentStatus::Remediating,
            "resolved" => IncidentStatus::Resolved,
            "failed" => IncidentStatus::Failed,
            _ => IncidentStatus::Detected,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IncidentStatus::Detected => 0,
            IncidentStatus::Diagnosing => 1,
            IncidentStatus::Diagnosed => 2,
            IncidentStatus::Remediating => 3,
            IncidentStatus::Resolved => 4,
            IncidentStatus::Failed => 4,
        }
    }

    /// Resolved and failed incidents are retained for audit, never reopened.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Failed)
    }

    /// Forward-only transition check. The one sanctioned backward move is
    /// remediating -> detected after a rollback restored the prior state.
    pub fn can_advance_to(&self, next: IncidentStatus) -> bool {
        if *self == IncidentStatus::Remediating && next == IncidentStatus::Detected {
            return true;
        }
        next.rank() > self.rank()
    }
}

/// Monitored metric kinds. The threshold table is keyed by these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    CpuUsage,
    MemoryUsage,
    DiskUsage,
    ServiceUp,
    NetworkIn,
    NetworkOut,
    ResponseTime,
    ErrorRate,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::CpuUsage => "cpu_usage",
            MetricKind::MemoryUsage => "memory_usage",
            MetricKind::DiskUsage => "disk_usage",
            MetricKind::ServiceUp => "service_up",
            MetricKind::NetworkIn => "network_in",
            MetricKind::NetworkOut => "network_out",
            MetricKind::ResponseTime => "response_time",
            MetricKind::ErrorRate => "error_rate",
        }
    }

    pub fn parse(s: &str) -> MetricKind {
        match s {
            "memory_usage" => MetricKind::MemoryUsage,
            "disk_usage" => MetricKind::DiskUsage,
            "service_up" => MetricKind::ServiceUp,
            "network_in" => MetricKind::NetworkIn,
            "network_out" => MetricKind::NetworkOut,
            "response_time" => MetricKind::ResponseTime,
            "error_rate" => MetricKind::ErrorRate,
            _ => MetricKind::CpuUsage,
        }
    }

    /// Human label for incident descriptions ("Cpu Usage", "Disk Usage").
    pub fn label(&self) -> String {
        self.as_str()
            .split('_')
            .map(|w| {
                let mut c = w.chars();
                match c.next() {
                    Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Infrastructure resource kinds, with a declared fallback instead of
/// free-text branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Droplet,
    Database,
    Kubernetes,
    LoadBalancer,
    Volume,
    Firewall,
    Vpc,
    Unknown,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Droplet => "droplet",
            ResourceKind::Database => "database",
            ResourceKind::Kubernetes => "kubernetes",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::Volume => "volume",
            ResourceKind::Firewall => "firewall",
            ResourceKind::Vpc => "vpc",
            ResourceKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> ResourceKind {
        match s {
            "droplet" => ResourceKind::Droplet,
            "database" => ResourceKind::Database,
            "kubernetes" => ResourceKind::Kubernetes,
            "load_balancer" => ResourceKind::LoadBalancer,
            "volume" => ResourceKind::Volume,
            "firewall" => ResourceKind::Firewall,
            "vpc" => ResourceKind::Vpc,
            _ => ResourceKind::Unknown,
        }
    }
}

/// A detected metric breach on one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_kind: ResourceKind,
    pub metric: MetricKind,
    pub current_value: f64,
    pub threshold_value: f64,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Incident {
    pub fn new(
        resource_id: impl Into<String>,
        resource_name: impl Into<String>,
        resource_kind: ResourceKind,
        metric: MetricKind,
        current_value: f64,
        threshold_value: f64,
        severity: Severity,
    ) -> Self {
        let resource_name = resource_name.into();
        let description = format!(
            "{} exceeded threshold on {}: {:.2} (threshold: {:.2})",
            metric.label(),
            resource_name,
            current_value,
            threshold_value
        );
        Self {
            id: Uuid::new_v4(),
            detected_at: Utc::now(),
            resource_id: resource_id.into(),
            resource_name,
            resource_kind,
            metric,
            current_value,
            threshold_value,
            severity,
            status: IncidentStatus::Detected,
            description,
            metadata: serde_json::json!({}),
        }
    }
}

/// Root cause categories a diagnosis can land in. `Unknown` is the declared
/// fallback for unparseable reasoning output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootCauseCategory {
    UndersizedResource,
    RunawayProcess,
    TrafficSpike,
    ConfigurationError,
    DependencyFailure,
    Unknown,
}

impl RootCauseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootCauseCategory::UndersizedResource => "undersized-resource",
            RootCauseCategory::RunawayProcess => "runaway-process",
            RootCauseCategory::TrafficSpike => "traffic-spike",
            RootCauseCategory::ConfigurationError => "configuration-error",
            RootCauseCategory::DependencyFailure => "dependency-failure",
            RootCauseCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> RootCauseCategory {
        match s.trim().to_ascii_lowercase().as_str() {
            "undersized-resource" | "undersized resource" | "capacity" => {
                RootCauseCategory::UndersizedResource
            }
            "runaway-process" | "runaway process" => RootCauseCategory::RunawayProcess,
            "traffic-spike" | "traffic spike" => RootCauseCategory::TrafficSpike,
            "configuration-error" | "configuration error" | "configuration" => {
                RootCauseCategory::ConfigurationError
            }
            "dependency-failure" | "dependency failure" | "dependency" => {
                RootCauseCategory::DependencyFailure
            }
            _ => RootCauseCategory::Unknown,
        }
    }
}

/// Scored root-cause analysis for exactly one incident. Immutable once
/// persisted; re-diagnosis creates a new record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub root_cause: String,
    pub category: RootCauseCategory,
    pub confidence: f64,
    pub reasoning: String,
    pub recommendations: Vec<String>,
    pub estimated_cost: Option<f64>,
    pub estimated_duration_secs: Option<u64>,
    /// Knowledge-base snippet ids the reasoning actually cited.
    pub citations: Vec<String>,
}

/// Remediation execution status. Advances forward only; rolled-back and
/// rejected are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    PendingApproval,
    Applying,
    Verifying,
    Succeeded,
    Failed,
    RolledBack,
    Rejected,
}

impl RemediationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationStatus::PendingApproval => "pending_approval",
            RemediationStatus::Applying => "applying",
            RemediationStatus::Verifying => "verifying",
            RemediationStatus::Succeeded => "succeeded",
            RemediationStatus::Failed => "failed",
            RemediationStatus::RolledBack => "rolled_back",
            RemediationStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> RemediationStatus {
        match s {
            "applying" => RemediationStatus::Applying,
            "verifying" => RemediationStatus::Verifying,
            "succeeded" => RemediationStatus::Succeeded,
            "failed" => RemediationStatus::Failed,
            "rolled_back" => RemediationStatus::RolledBack,
            "rejected" => RemediationStatus::Rejected,
            _ => RemediationStatus::PendingApproval,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemediationStatus::Succeeded
                | RemediationStatus::Failed
                | RemediationStatus::RolledBack
                | RemediationStatus::Rejected
        )
    }
}

/// Risk level annotated by the safety validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    pub fn parse(s: &str) -> RiskLevel {
        match s {
            "high" => RiskLevel::High,
            "medium" => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

/// Execution record of one remediation attempt (1:1 with a diagnosis).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remediation {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// The generated IaC document this remediation applies.
    pub document: String,
    pub action_summary: String,
    pub cost_delta: f64,
    pub risk: RiskLevel,
    pub requires_approval: bool,
    pub status: RemediationStatus,
    /// Append-only, ordered. One line per state transition or notable step.
    pub logs: Vec<String>,
    pub verification_passed: bool,
    pub rollback_executed: bool,
    pub error: Option<String>,
    pub duration_secs: f64,
}

impl Remediation {
    pub fn new(
        incident_id: Uuid,
        document: String,
        action_summary: String,
        cost_delta: f64,
        risk: RiskLevel,
        requires_approval: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id,
            created_at: Utc::now(),
            document,
            action_summary,
            cost_delta,
            risk,
            requires_approval,
            status: RemediationStatus::PendingApproval,
            logs: Vec::new(),
            verification_passed: false,
            rollback_executed: false,
            error: None,
            duration_secs: 0.0,
        }
    }
}

/// A created resource as reported back from an IaC apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incident_status_moves_forward_only() {
        assert!(IncidentStatus::Detected.can_advance_to(IncidentStatus::Diagnosing));
        assert!(IncidentStatus::Diagnosing.can_advance_to(IncidentStatus::Diagnosed));
        assert!(IncidentStatus::Diagnosed.can_advance_to(IncidentStatus::Remediating));
        assert!(IncidentStatus::Remediating.can_advance_to(IncidentStatus::Resolved));
        assert!(!IncidentStatus::Diagnosed.can_advance_to(IncidentStatus::Detected));
        assert!(!IncidentStatus::Resolved.can_advance_to(IncidentStatus::Detected));
    }

    #[test]
    fn rollback_to_detected_is_the_only_backward_move() {
        assert!(IncidentStatus::Remediating.can_advance_to(IncidentStatus::Detected));
        assert!(!IncidentStatus::Diagnosing.can_advance_to(IncidentStatus::Detected));
    }

    #[test]
    fn enum_round_trips() {
        for s in [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            assert_eq!(Severity::parse(s.as_str()), s);
        }
        for m in [
            MetricKind::CpuUsage,
            MetricKind::MemoryUsage,
            MetricKind::DiskUsage,
            MetricKind::ServiceUp,
        ] {
            assert_eq!(MetricKind::parse(m.as_str()), m);
        }
        for c in [
            RootCauseCategory::UndersizedResource,
            RootCauseCategory::RunawayProcess,
            RootCauseCategory::TrafficSpike,
            RootCauseCategory::ConfigurationError,
            RootCauseCategory::DependencyFailure,
            RootCauseCategory::Unknown,
        ] {
            assert_eq!(RootCauseCategory::parse(c.as_str()), c);
        }
    }

    #[test]
    fn category_parse_accepts_loose_spellings() {
        assert_eq!(
            RootCauseCategory::parse("Undersized Resource"),
            RootCauseCategory::UndersizedResource
        );
        assert_eq!(
            RootCauseCategory::parse("capacity"),
            RootCauseCategory::UndersizedResource
        );
        assert_eq!(
            RootCauseCategory::parse("something else entirely"),
            RootCauseCategory::Unknown
        );
    }

    #[test]
    fn metric_label_is_title_cased() {
        assert_eq!(MetricKind::CpuUsage.label(), "Cpu Usage");
        assert_eq!(MetricKind::DiskUsage.label(), "Disk Usage");
    }
}
