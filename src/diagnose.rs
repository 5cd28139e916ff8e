//! Diagnostic engine -- composes knowledge-base context, metric history, and
//! reasoning output into a scored diagnosis.
//!
//! Reasoning output is untrusted: it is parsed into a fixed line format and
//! the confidence score is always recomputed here, never taken verbatim.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::cloud::{CloudResource, CloudResources};
use crate::clients::knowledge::{KnowledgeBase, KnowledgeSnippet};
use crate::clients::metrics::MetricsQuery;
use crate::clients::reasoning::Reasoning;
use crate::model::{Diagnosis, Incident, IncidentStatus, MetricKind, RootCauseCategory};
use crate::storage::IncidentStore;

/// Weighted confidence composition:
/// `0.4 * kb_match + 0.3 * state_validation + 0.3 * historical_success`,
/// every term and the result clamped to [0,1].
pub fn compose_confidence(kb_match: f64, state_validation: f64, historical: f64) -> f64 {
    let clamp = |v: f64| v.clamp(0.0, 1.0);
    clamp(0.4 * clamp(kb_match) + 0.3 * clamp(state_validation) + 0.3 * clamp(historical))
}

/// Mean relevance of the snippets the reasoning actually cited. Citations
/// that match nothing retrieved are ignored; no usable citations scores 0.
pub fn kb_match_score(snippets: &[KnowledgeSnippet], citations: &[String]) -> f64 {
    let cited: Vec<f64> = snippets
        .iter()
        .filter(|s| citations.iter().any(|c| c == &s.id))
        .map(|s| s.relevance)
        .collect();
    if cited.is_empty() {
        0.0
    } else {
        cited.iter().sum::<f64>() / cited.len() as f64
    }
}

/// 1.0 iff the independently queried resource state is consistent with the
/// claimed root-cause category, else 0.0. Consistency means the resource
/// still exists and the category plausibly explains the breached metric.
pub fn state_validation_score(
    category: RootCauseCategory,
    metric: MetricKind,
    resource: Option<&CloudResource>,
) -> f64 {
    if resource.is_none() {
        return 0.0;
    }
    let plausible = match category {
        RootCauseCategory::UndersizedResource => matches!(
            metric,
            MetricKind::CpuUsage | MetricKind::MemoryUsage | MetricKind::DiskUsage
        ),
        RootCauseCategory::RunawayProcess => {
            matches!(metric, MetricKind::CpuUsage | MetricKind::MemoryUsage)
        }
        RootCauseCategory::TrafficSpike => matches!(
            metric,
            MetricKind::CpuUsage
                | MetricKind::NetworkIn
                | MetricKind::NetworkOut
                | MetricKind::ResponseTime
                | MetricKind::ErrorRate
        ),
        RootCauseCategory::ConfigurationError => true,
        RootCauseCategory::DependencyFailure => matches!(
            metric,
            MetricKind::ServiceUp | MetricKind::ErrorRate | MetricKind::ResponseTime
        ),
        RootCauseCategory::Unknown => false,
    };
    if plausible {
        1.0
    } else {
        0.0
    }
}

/// Structured fields extracted from a reasoning response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDiagnosis {
    pub root_cause: String,
    pub category: RootCauseCategory,
    pub reasoning: String,
    pub recommendations: Vec<String>,
}

/// Parse the fixed `ROOT CAUSE:` / `CATEGORY:` / `REASONING:` /
/// `RECOMMENDATIONS:` line format, with declared fallbacks for anything the
/// response omits.
pub fn parse_generation(text: &str, incident: &Incident) -> ParsedDiagnosis {
    let mut root_cause = String::new();
    let mut category = RootCauseCategory::Unknown;
    let mut reasoning = String::new();
    let mut recommendations = Vec::new();

    #[derive(PartialEq)]
    enum Section {
        None,
        Reasoning,
        Recommendations,
    }
    let mut section = Section::None;

    for raw in text.lines() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("ROOT CAUSE:") {
            root_cause = rest.trim().to_string();
            section = Section::None;
        } else if let Some(rest) = line.strip_prefix("CATEGORY:") {
            category = RootCauseCategory::parse(rest);
            section = Section::None;
        } else if let Some(rest) = line.strip_prefix("REASONING:") {
            reasoning = rest.trim().to_string();
            section = Section::Reasoning;
        } else if line.starts_with("RECOMMENDATIONS:") {
            section = Section::Recommendations;
        } else if section == Section::Reasoning && !line.is_empty() {
            if !reasoning.is_empty() {
                reasoning.push(' ');
            }
            reasoning.push_str(line);
        } else if section == Section::Recommendations && !line.is_empty() {
            let item = line
                .trim_start_matches(|c: char| {
                    c.is_ascii_digit() || matches!(c, '.' | '-' | ')' | '*' | ' ')
                })
                .trim();
            if !item.is_empty() {
                recommendations.push(item.to_string());
            }
        }
    }

    if root_cause.is_empty() {
        root_cause = format!(
            "Elevated {} on {}",
            incident.metric.label().to_lowercase(),
            incident.resource_name
        );
    }
    if reasoning.is_empty() {
        reasoning = text.chars().take(200).collect();
    }
    if recommendations.is_empty() {
        recommendations = vec![
            "Scale up the affected resource".to_string(),
            "Investigate recent workload changes".to_string(),
        ];
    }

    ParsedDiagnosis {
        root_cause,
        category,
        reasoning,
        recommendations,
    }
}

/// Deterministic cost/duration estimates keyed by the breached metric.
fn estimate_remediation(metric: MetricKind) -> (Option<f64>, Option<u64>) {
    match metric {
        MetricKind::CpuUsage | MetricKind::MemoryUsage => (Some(12.0), Some(90)),
        MetricKind::DiskUsage => (Some(10.0), Some(60)),
        _ => (Some(0.0), Some(30)),
    }
}

pub struct DiagnosticEngine {
    knowledge: Arc<dyn KnowledgeBase>,
    metrics: Arc<dyn MetricsQuery>,
    cloud: Arc<dyn CloudResources>,
    reasoning: Arc<dyn Reasoning>,
    store: IncidentStore,
}

impl DiagnosticEngine {
    const TOP_K: usize = 5;

    pub fn new(
        knowledge: Arc<dyn KnowledgeBase>,
        metrics: Arc<dyn MetricsQuery>,
        cloud: Arc<dyn CloudResources>,
        reasoning: Arc<dyn Reasoning>,
        store: IncidentStore,
    ) -> Self {
        Self {
            knowledge,
            metrics,
            cloud,
            reasoning,
            store,
        }
    }

    /// Diagnose one incident. Always produces exactly one persisted
    /// diagnosis: a reasoning failure yields category=unknown with
    /// confidence 0.0 rather than no record.
    pub async fn diagnose(&self, incident_id: Uuid) -> Result<Diagnosis> {
        let Some(incident) = self.store.get_incident(incident_id)? else {
            anyhow::bail!("incident {incident_id} not found");
        };
        if incident.status == IncidentStatus::Detected {
            self.store
                .set_incident_status(incident.id, IncidentStatus::Diagnosing)?;
        }

        // Knowledge-base retrieval degrades to empty context on failure; only
        // a reasoning failure forces the unknown diagnosis.
        let query = format!(
            "{} {} {} {:.1} severity {}",
            incident.metric.as_str(),
            incident.resource_kind.as_str(),
            incident.resource_name,
            incident.current_value,
            incident.severity.as_str()
        );
        let snippets = match self.knowledge.search(&query, Self::TOP_K).await {
            Ok(s) => s,
            Err(e) => {
                warn!(incident = %incident.id, error = %e, "knowledge base unavailable");
                Vec::new()
            }
        };

        let history = self.recent_history(&incident).await;
        let resource = self.cloud.get_resource(&incident.resource_id).await.ok();

        let prompt = build_prompt(&incident, &snippets, &history, resource.as_ref());

        let diagnosis = match self.reasoning.complete(&prompt).await {
            Ok(generation) => {
                let parsed = parse_generation(&generation.text, &incident);
                let kb = kb_match_score(&snippets, &generation.citations);
                let state =
                    state_validation_score(parsed.category, incident.metric, resource.as_ref());
                let historical = self.store.historical_success_rate(parsed.category)?;
                let confidence = compose_confidence(kb, state, historical);
                let (estimated_cost, estimated_duration_secs) =
                    estimate_remediation(incident.metric);

                Diagnosis {
                    id: Uuid::new_v4(),
                    incident_id: incident.id,
                    created_at: Utc::now(),
                    root_cause: parsed.root_cause,
                    category: parsed.category,
                    confidence,
                    reasoning: parsed.reasoning,
                    recommendations: parsed.recommendations,
                    estimated_cost,
                    estimated_duration_secs,
                    citations: generation.citations,
                }
            }
            Err(e) => {
                warn!(incident = %incident.id, error = %e, "reasoning service failed");
                Diagnosis {
                    id: Uuid::new_v4(),
                    incident_id: incident.id,
                    created_at: Utc::now(),
                    root_cause: "Undetermined".to_string(),
                    category: RootCauseCategory::Unknown,
                    confidence: 0.0,
                    reasoning: format!("reasoning service error: {e}"),
                    recommendations: Vec::new(),
                    estimated_cost: None,
                    estimated_duration_secs: None,
                    citations: Vec::new(),
                }
            }
        };

        self.store.insert_diagnosis(&diagnosis)?;
        // Re-diagnosis of an already-diagnosed (or remediating) incident
        // appends the record without touching the status machine.
        if matches!(
            incident.status,
            IncidentStatus::Detected | IncidentStatus::Diagnosing
        ) {
            self.store
                .set_incident_status(incident.id, IncidentStatus::Diagnosed)?;
        }
        info!(
            incident = %incident.id,
            diagnosis = %diagnosis.id,
            category = diagnosis.category.as_str(),
            confidence = diagnosis.confidence,
            "diagnosis complete"
        );
        Ok(diagnosis)
    }

    async fn recent_history(&self, incident: &Incident) -> Vec<f64> {
        let end = Utc::now();
        let start = incident.detected_at - ChronoDuration::minutes(15);
        match self
            .metrics
            .range(&incident.resource_id, incident.metric, start, end, 60)
            .await
        {
            Ok(samples) => samples.into_iter().map(|(_, v)| v).collect(),
            Err(e) => {
                warn!(incident = %incident.id, error = %e, "history query failed");
                Vec::new()
            }
        }
    }
}

fn build_prompt(
    incident: &Incident,
    snippets: &[KnowledgeSnippet],
    history: &[f64],
    resource: Option<&CloudResource>,
) -> String {
    let kb_context = if snippets.is_empty() {
        "No similar past incidents found.".to_string()
    } else {
        snippets
            .iter()
            .map(|s| format!("[{}] ({}): {}", s.id, s.source, s.content))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let history_line = if history.is_empty() {
        "unavailable".to_string()
    } else {
        history
            .iter()
            .map(|v| format!("{v:.1}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let state_line = match resource {
        Some(r) => format!(
            "status={} size={} region={}",
            r.status,
            r.size_slug.as_deref().unwrap_or("unknown"),
            r.region.as_deref().unwrap_or("unknown")
        ),
        None => "unavailable".to_string(),
    };

    format!(
        "Analyze this infrastructure incident and provide a diagnosis.\n\
         \n\
         INCIDENT:\n\
         - Resource: {} ({})\n\
         - Metric: {} = {:.2} (threshold {:.2})\n\
         - Severity: {}\n\
         - Description: {}\n\
         \n\
         CURRENT RESOURCE STATE: {}\n\
         RECENT SAMPLES: {}\n\
         \n\
         KNOWLEDGE BASE CONTEXT:\n{}\n\
         \n\
         Respond in exactly this format:\n\
         ROOT CAUSE: <one sentence>\n\
         CATEGORY: <undersized-resource|runaway-process|traffic-spike|configuration-error|dependency-failure|unknown>\n\
         REASONING: <how you reached the conclusion>\n\
         RECOMMENDATIONS:\n\
         1. <action>\n\
         2. <action>\n",
        incident.resource_name,
        incident.resource_kind.as_str(),
        incident.metric.as_str(),
        incident.current_value,
        incident.threshold_value,
        incident.severity.as_str(),
        incident.description,
        state_line,
        history_line,
        kb_context,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceKind, Severity};

    fn snippet(id: &str, relevance: f64) -> KnowledgeSnippet {
        KnowledgeSnippet {
            id: id.to_string(),
            content: "runbook".to_string(),
            source: "kb".to_string(),
            relevance,
        }
    }

    fn sample_incident() -> Incident {
        Incident::new(
            "droplet-1",
            "web-app",
            ResourceKind::Droplet,
            MetricKind::CpuUsage,
            95.2,
            80.0,
            Severity::Critical,
        )
    }

    #[test]
    fn confidence_matches_weighted_sum() {
        // 0.4*0.9 + 0.3*1.0 + 0.3*0.8 = 0.96
        let c = compose_confidence(0.9, 1.0, 0.8);
        assert!((c - 0.96).abs() < 1e-9);
    }

    #[test]
    fn confidence_terms_are_clamped() {
        let c = compose_confidence(1.8, -0.5, 2.0);
        // Terms clamp to 1.0, 0.0, 1.0 -> 0.4 + 0.0 + 0.3 = 0.7
        assert!((c - 0.7).abs() < 1e-9);
        assert!(compose_confidence(5.0, 5.0, 5.0) <= 1.0);
        assert!(compose_confidence(-5.0, -5.0, -5.0) >= 0.0);
    }

    #[test]
    fn kb_score_averages_cited_snippets_only() {
        let snippets = vec![snippet("a", 0.9), snippet("b", 0.5), snippet("c", 0.1)];
        let score = kb_match_score(&snippets, &["a".to_string(), "b".to_string()]);
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn kb_score_without_citations_is_zero() {
        let snippets = vec![snippet("a", 0.9)];
        assert_eq!(kb_match_score(&snippets, &[]), 0.0);
        assert_eq!(kb_match_score(&snippets, &["ghost".to_string()]), 0.0);
        assert_eq!(kb_match_score(&[], &["a".to_string()]), 0.0);
    }

    #[test]
    fn state_score_checks_category_metric_plausibility() {
        let resource = CloudResource {
            id: "droplet-1".into(),
            name: "web-app".into(),
            kind: ResourceKind::Droplet,
            region: None,
            size_slug: Some("s-1vcpu-1gb".into()),
            status: "active".into(),
            tags: vec![],
        };
        assert_eq!(
            state_validation_score(
                RootCauseCategory::UndersizedResource,
                MetricKind::CpuUsage,
                Some(&resource)
            ),
            1.0
        );
        assert_eq!(
            state_validation_score(
                RootCauseCategory::RunawayProcess,
                MetricKind::DiskUsage,
                Some(&resource)
            ),
            0.0
        );
        assert_eq!(
            state_validation_score(
                RootCauseCategory::UndersizedResource,
                MetricKind::CpuUsage,
                None
            ),
            0.0
        );
        assert_eq!(
            state_validation_score(RootCauseCategory::Unknown, MetricKind::CpuUsage, Some(&resource)),
            0.0
        );
    }

    #[test]
    fn parse_extracts_all_sections() {
        let text = "ROOT CAUSE: Droplet undersized for sustained load\n\
                    CATEGORY: undersized-resource\n\
                    REASONING: CPU pinned above 90% with no\n\
                    memory pressure observed.\n\
                    RECOMMENDATIONS:\n\
                    1. Resize to s-2vcpu-2gb\n\
                    2. Enable alerting at 70%\n";
        let parsed = parse_generation(text, &sample_incident());
        assert_eq!(parsed.root_cause, "Droplet undersized for sustained load");
        assert_eq!(parsed.category, RootCauseCategory::UndersizedResource);
        assert_eq!(
            parsed.reasoning,
            "CPU pinned above 90% with no memory pressure observed."
        );
        assert_eq!(
            parsed.recommendations,
            vec![
                "Resize to s-2vcpu-2gb".to_string(),
                "Enable alerting at 70%".to_string()
            ]
        );
    }

    #[test]
    fn parse_falls_back_on_freeform_text() {
        let parsed = parse_generation("the model rambled with no structure", &sample_incident());
        assert_eq!(parsed.category, RootCauseCategory::Unknown);
        assert!(parsed.root_cause.contains("web-app"));
        assert!(!parsed.recommendations.is_empty());
    }
}
