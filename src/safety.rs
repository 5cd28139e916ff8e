//! Safety validator -- the shared gate run before every apply, remediation
//! and provisioning alike. It annotates the action, never mutates it.

use serde::Serialize;
use tracing::debug;

use crate::model::RiskLevel;

/// Operation verbs that always require a human, whatever the cost.
pub const DESTRUCTIVE_VERBS: &[&str] = &["delete", "destroy", "terminate", "drop", "remove"];

/// Statically inspect a document for known operation verbs. Word-boundary
/// matching, so "undeleted_marker" does not trip "delete".
pub fn inspect_verbs(document: &str) -> Vec<String> {
    let mut found = Vec::new();
    for word in document
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
    {
        let lower = word.to_ascii_lowercase();
        if DESTRUCTIVE_VERBS.contains(&lower.as_str()) && !found.contains(&lower) {
            found.push(lower);
        }
    }
    found
}

/// An action awaiting the gate: the IaC document, its estimated monthly cost
/// delta, the verbs found by static inspection, and whether a prior-state
/// snapshot is possible.
#[derive(Debug, Clone)]
pub struct ProposedAction {
    pub document: String,
    pub cost_delta: f64,
    pub verbs: Vec<String>,
    pub has_rollback_path: bool,
}

impl ProposedAction {
    pub fn new(document: impl Into<String>, cost_delta: f64, has_rollback_path: bool) -> Self {
        let document = document.into();
        let verbs = inspect_verbs(&document);
        Self {
            document,
            cost_delta,
            verbs,
            has_rollback_path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    ApproveAuto,
    RequireHuman,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyReport {
    pub verdict: Verdict,
    pub risk: RiskLevel,
    pub requires_approval: bool,
    pub reasons: Vec<String>,
}

pub struct SafetyValidator {
    cost_ceiling: f64,
}

impl SafetyValidator {
    pub fn new(cost_ceiling: f64) -> Self {
        Self { cost_ceiling }
    }

    /// Ordered rules, first match wins:
    /// 1. destructive verb present        -> require human, high risk
    /// 2. cost delta above the ceiling    -> require human, medium risk
    /// 3. no rollback path derivable      -> require human, medium risk
    /// 4. otherwise                       -> auto-approve, low risk
    pub fn validate(&self, action: &ProposedAction) -> SafetyReport {
        let report = if !action.verbs.is_empty() {
            SafetyReport {
                verdict: Verdict::RequireHuman,
                risk: RiskLevel::High,
                requires_approval: true,
                reasons: vec![format!(
                    "destructive operation(s) detected: {}",
                    action.verbs.join(", ")
                )],
            }
        } else if action.cost_delta > self.cost_ceiling {
            SafetyReport {
                verdict: Verdict::RequireHuman,
                risk: RiskLevel::Medium,
                requires_approval: true,
                reasons: vec![format!(
                    "estimated cost ${:.2}/month exceeds ceiling ${:.2}/month",
                    action.cost_delta, self.cost_ceiling
                )],
            }
        } else if !action.has_rollback_path {
            SafetyReport {
                verdict: Verdict::RequireHuman,
                risk: RiskLevel::Medium,
                requires_approval: true,
                reasons: vec!["no rollback path derivable".to_string()],
            }
        } else {
            SafetyReport {
                verdict: Verdict::ApproveAuto,
                risk: RiskLevel::Low,
                requires_approval: false,
                reasons: Vec::new(),
            }
        };

        debug!(
            verdict = ?report.verdict,
            risk = report.risk.as_str(),
            cost = action.cost_delta,
            "safety verdict"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_requires_approval_regardless_of_cost() {
        let validator = SafetyValidator::new(50.0);
        let action = ProposedAction::new(r#"resource "droplet" "x" { destroy = true }"#, 0.0, true);
        let report = validator.validate(&action);
        assert!(report.requires_approval);
        assert_eq!(report.risk, RiskLevel::High);
        assert_eq!(report.verdict, Verdict::RequireHuman);
    }

    #[test]
    fn cost_over_ceiling_is_medium_risk() {
        let validator = SafetyValidator::new(50.0);
        let action = ProposedAction::new("resource \"droplet\" \"x\" {}", 72.0, true);
        let report = validator.validate(&action);
        assert!(report.requires_approval);
        assert_eq!(report.risk, RiskLevel::Medium);
    }

    #[test]
    fn missing_rollback_path_requires_human() {
        let validator = SafetyValidator::new(50.0);
        let action = ProposedAction::new("resource \"droplet\" \"x\" {}", 6.0, false);
        let report = validator.validate(&action);
        assert!(report.requires_approval);
        assert_eq!(report.risk, RiskLevel::Medium);
    }

    #[test]
    fn clean_cheap_reversible_action_auto_approves() {
        let validator = SafetyValidator::new(50.0);
        let action = ProposedAction::new("resource \"droplet\" \"x\" { size = \"s-1vcpu-1gb\" }", 6.0, true);
        let report = validator.validate(&action);
        assert!(!report.requires_approval);
        assert_eq!(report.risk, RiskLevel::Low);
        assert_eq!(report.verdict, Verdict::ApproveAuto);
    }

    #[test]
    fn verdict_is_monotonic_in_cost() {
        let validator = SafetyValidator::new(50.0);
        let mut previously_required = false;
        for cost in [0.0, 10.0, 49.99, 50.0, 50.01, 100.0, 1000.0] {
            let action = ProposedAction::new("resource \"droplet\" \"x\" {}", cost, true);
            let requires = validator.validate(&action).requires_approval;
            // Once a cost requires approval, any higher cost must too.
            assert!(
                !previously_required || requires,
                "verdict flipped back to auto at cost {cost}"
            );
            previously_required = requires;
        }
    }

    #[test]
    fn verb_inspection_uses_word_boundaries() {
        assert_eq!(inspect_verbs("terraform destroy everything"), vec!["destroy"]);
        assert!(inspect_verbs("undeleted_marker = true").is_empty());
        assert_eq!(
            inspect_verbs("delete then DELETE then Remove"),
            vec!["delete", "remove"]
        );
        assert!(inspect_verbs("resource \"droplet\" \"web\" {}").is_empty());
    }
}
