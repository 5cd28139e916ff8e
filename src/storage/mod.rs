//! SQLite storage layer -- schema, queries, migrations.
//!
//! The store is the single source of truth for incidents, diagnoses,
//! remediations, and provision results. SQLite's single-writer WAL mode
//! serializes writes (per incident id and stronger) while readers proceed
//! concurrently.

pub mod schema;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use uuid::Uuid;

use crate::model::provision::ProvisionResult;
use crate::model::{
    Diagnosis, Incident, IncidentStatus, MetricKind, Remediation, RemediationStatus,
    ResourceKind, RiskLevel, RootCauseCategory, Severity,
};

/// Connection pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn json_vec(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

/// Durable keyed storage for the four pipeline entities.
#[derive(Clone)]
pub struct IncidentStore {
    pool: Pool,
}

impl IncidentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // ---- incidents ----

    pub fn insert_incident(&self, incident: &Incident) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO incidents (
                id, detected_at, resource_id, resource_name, resource_kind,
                metric, current_value, threshold_value, severity, status,
                description, metadata_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                incident.id.to_string(),
                incident.detected_at.to_rfc3339(),
                incident.resource_id,
                incident.resource_name,
                incident.resource_kind.as_str(),
                incident.metric.as_str(),
                incident.current_value,
                incident.threshold_value,
                incident.severity.as_str(),
                incident.status.as_str(),
                incident.description,
                serde_json::to_string(&incident.metadata)?,
            ],
        )
        .context("failed to insert incident")?;
        Ok(())
    }

    fn incident_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
        let id: String = row.get(0)?;
        let detected_at: String = row.get(1)?;
        let kind: String = row.get(4)?;
        let metric: String = row.get(5)?;
        let severity: String = row.get(8)?;
        let status: String = row.get(9)?;
        let metadata: String = row.get(11)?;
        Ok(Incident {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            detected_at: parse_ts(&detected_at),
            resource_id: row.get(2)?,
            resource_name: row.get(3)?,
            resource_kind: ResourceKind::parse(&kind),
            metric: MetricKind::parse(&metric),
            current_value: row.get(6)?,
            threshold_value: row.get(7)?,
            severity: Severity::parse(&severity),
            status: IncidentStatus::parse(&status),
            description: row.get(10)?,
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        })
    }

    const INCIDENT_COLS: &'static str =
        "id, detected_at, resource_id, resource_name, resource_kind, metric, \
         current_value, threshold_value, severity, status, description, metadata_json";

    pub fn get_incident(&self, id: Uuid) -> Result<Option<Incident>> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {} FROM incidents WHERE id = ?1", Self::INCIDENT_COLS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id.to_string()], Self::incident_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_incidents(&self, limit: usize) -> Result<Vec<Incident>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM incidents ORDER BY detected_at DESC LIMIT ?1",
            Self::INCIDENT_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], Self::incident_from_row)?;
        let mut incidents = Vec::new();
        for r in rows {
            incidents.push(r?);
        }
        Ok(incidents)
    }

    /// Open (non-terminal) incident for a (resource, metric) pair, if any.
    /// Monitor checks this before creating a new incident so scans are
    /// idempotent.
    pub fn find_open_incident(
        &self,
        resource_id: &str,
        metric: MetricKind,
    ) -> Result<Option<Uuid>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM incidents
             WHERE resource_id = ?1 AND metric = ?2
               AND status NOT IN ('resolved', 'failed')
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![resource_id, metric.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        match rows.next() {
            Some(row) => Ok(Some(Uuid::parse_str(&row?).unwrap_or_default())),
            None => Ok(None),
        }
    }

    /// Advance an incident's status, enforcing the forward-only state
    /// machine. The one backward move allowed is remediating -> detected
    /// after a rollback.
    pub fn set_incident_status(&self, id: Uuid, next: IncidentStatus) -> Result<()> {
        let Some(current) = self.get_incident(id)? else {
            bail!("incident {id} not found");
        };
        if !current.status.can_advance_to(next) {
            bail!(
                "invalid incident transition {} -> {} for {id}",
                current.status.as_str(),
                next.as_str()
            );
        }
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE incidents SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![next.as_str(), id.to_string()],
        )?;
        Ok(())
    }

    // ---- diagnoses ----

    pub fn insert_diagnosis(&self, diagnosis: &Diagnosis) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO diagnoses (
                id, incident_id, created_at, root_cause, category, confidence,
                reasoning, recommendations_json, estimated_cost,
                estimated_duration_secs, citations_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                diagnosis.id.to_string(),
                diagnosis.incident_id.to_string(),
                diagnosis.created_at.to_rfc3339(),
                diagnosis.root_cause,
                diagnosis.category.as_str(),
                diagnosis.confidence,
                diagnosis.reasoning,
                serde_json::to_string(&diagnosis.recommendations)?,
                diagnosis.estimated_cost,
                diagnosis.estimated_duration_secs.map(|d| d as i64),
                serde_json::to_string(&diagnosis.citations)?,
            ],
        )
        .context("failed to insert diagnosis")?;
        Ok(())
    }

    fn diagnosis_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Diagnosis> {
        let id: String = row.get(0)?;
        let incident_id: String = row.get(1)?;
        let created_at: String = row.get(2)?;
        let category: String = row.get(4)?;
        let recommendations: String = row.get(7)?;
        let citations: String = row.get(10)?;
        Ok(Diagnosis {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            incident_id: Uuid::parse_str(&incident_id).unwrap_or_default(),
            created_at: parse_ts(&created_at),
            root_cause: row.get(3)?,
            category: RootCauseCategory::parse(&category),
            confidence: row.get(5)?,
            reasoning: row.get(6)?,
            recommendations: json_vec(&recommendations),
            estimated_cost: row.get(8)?,
            estimated_duration_secs: row.get::<_, Option<i64>>(9)?.map(|d| d as u64),
            citations: json_vec(&citations),
        })
    }

    const DIAGNOSIS_COLS: &'static str =
        "id, incident_id, created_at, root_cause, category, confidence, reasoning, \
         recommendations_json, estimated_cost, estimated_duration_secs, citations_json";

    /// The newest diagnosis for an incident. Diagnoses are immutable;
    /// re-diagnosis appends a new record and this returns the latest.
    pub fn latest_diagnosis(&self, incident_id: Uuid) -> Result<Option<Diagnosis>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM diagnoses WHERE incident_id = ?1
             ORDER BY created_at DESC LIMIT 1",
            Self::DIAGNOSIS_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows =
            stmt.query_map(params![incident_id.to_string()], Self::diagnosis_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Fraction of past diagnoses in this category whose remediation reached
    /// succeeded. 0.5 with no history, to avoid false certainty either way.
    pub fn historical_success_rate(&self, category: RootCauseCategory) -> Result<f64> {
        let conn = self.pool.get()?;
        let (total, succeeded): (i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN r.status = 'succeeded' THEN 1 ELSE 0 END), 0)
             FROM diagnoses d
             JOIN remediations r ON r.incident_id = d.incident_id
             WHERE d.category = ?1
               AND r.status IN ('succeeded', 'failed', 'rolled_back')",
            params![category.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if total == 0 {
            Ok(0.5)
        } else {
            Ok(succeeded as f64 / total as f64)
        }
    }

    // ---- remediations ----

    pub fn insert_remediation(&self, remediation: &Remediation) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO remediations (
                id, incident_id, created_at, document, action_summary, cost_delta,
                risk, requires_approval, status, logs_json, verification_passed,
                rollback_executed, error, duration_secs
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                remediation.id.to_string(),
                remediation.incident_id.to_string(),
                remediation.created_at.to_rfc3339(),
                remediation.document,
                remediation.action_summary,
                remediation.cost_delta,
                remediation.risk.as_str(),
                remediation.requires_approval as i64,
                remediation.status.as_str(),
                serde_json::to_string(&remediation.logs)?,
                remediation.verification_passed as i64,
                remediation.rollback_executed as i64,
                remediation.error,
                remediation.duration_secs,
            ],
        )
        .context("failed to insert remediation")?;
        Ok(())
    }

    /// Persist the mutable tail of a remediation record (status, logs,
    /// flags). The identity columns never change.
    pub fn update_remediation(&self, remediation: &Remediation) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE remediations SET
                status = ?1, logs_json = ?2, verification_passed = ?3,
                rollback_executed = ?4, error = ?5, duration_secs = ?6
             WHERE id = ?7",
            params![
                remediation.status.as_str(),
                serde_json::to_string(&remediation.logs)?,
                remediation.verification_passed as i64,
                remediation.rollback_executed as i64,
                remediation.error,
                remediation.duration_secs,
                remediation.id.to_string(),
            ],
        )?;
        Ok(())
    }

    fn remediation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Remediation> {
        let id: String = row.get(0)?;
        let incident_id: String = row.get(1)?;
        let created_at: String = row.get(2)?;
        let risk: String = row.get(6)?;
        let status: String = row.get(8)?;
        let logs: String = row.get(9)?;
        Ok(Remediation {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            incident_id: Uuid::parse_str(&incident_id).unwrap_or_default(),
            created_at: parse_ts(&created_at),
            document: row.get(3)?,
            action_summary: row.get(4)?,
            cost_delta: row.get(5)?,
            risk: RiskLevel::parse(&risk),
            requires_approval: row.get::<_, i64>(7)? != 0,
            status: RemediationStatus::parse(&status),
            logs: json_vec(&logs),
            verification_passed: row.get::<_, i64>(10)? != 0,
            rollback_executed: row.get::<_, i64>(11)? != 0,
            error: row.get(12)?,
            duration_secs: row.get(13)?,
        })
    }

    const REMEDIATION_COLS: &'static str =
        "id, incident_id, created_at, document, action_summary, cost_delta, risk, \
         requires_approval, status, logs_json, verification_passed, rollback_executed, \
         error, duration_secs";

    pub fn get_remediation(&self, id: Uuid) -> Result<Option<Remediation>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM remediations WHERE id = ?1",
            Self::REMEDIATION_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id.to_string()], Self::remediation_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn latest_remediation(&self, incident_id: Uuid) -> Result<Option<Remediation>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM remediations WHERE incident_id = ?1
             ORDER BY created_at DESC LIMIT 1",
            Self::REMEDIATION_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows =
            stmt.query_map(params![incident_id.to_string()], Self::remediation_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ---- provision results ----

    pub fn insert_provision_result(
        &self,
        requester: &str,
        description: &str,
        result: &ProvisionResult,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO provision_results (
                request_id, requester, description, success, resources_json,
                cost_estimate, document, error, validation_errors_json,
                logs_json, completed_at, duration_secs
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                result.request_id.to_string(),
                requester,
                description,
                result.success as i64,
                serde_json::to_string(&result.resources_created)?,
                result.cost_estimate,
                result.document,
                result.error,
                serde_json::to_string(&result.validation_errors)?,
                serde_json::to_string(&result.logs)?,
                result.completed_at.to_rfc3339(),
                result.duration_secs,
            ],
        )
        .context("failed to insert provision result")?;
        Ok(())
    }

    pub fn get_provision_result(&self, request_id: Uuid) -> Result<Option<ProvisionResult>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT request_id, success, resources_json, cost_estimate, document,
                    error, validation_errors_json, logs_json, completed_at, duration_secs
             FROM provision_results WHERE request_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![request_id.to_string()], |row| {
            let request_id: String = row.get(0)?;
            let resources: String = row.get(2)?;
            let validation_errors: String = row.get(6)?;
            let logs: String = row.get(7)?;
            let completed_at: String = row.get(8)?;
            Ok(ProvisionResult {
                request_id: Uuid::parse_str(&request_id).unwrap_or_default(),
                success: row.get::<_, i64>(1)? != 0,
                resources_created: serde_json::from_str(&resources).unwrap_or_default(),
                cost_estimate: row.get(3)?,
                document: row.get(4)?,
                error: row.get(5)?,
                validation_errors: json_vec(&validation_errors),
                logs: json_vec(&logs),
                completed_at: parse_ts(&completed_at),
                duration_secs: row.get(9)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ---- aggregate status ----

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let conn = self.pool.get()?;
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM incidents WHERE status NOT IN ('resolved', 'failed')",
            [],
            |row| row.get(0),
        )?;
        let resolved_today: i64 = conn.query_row(
            "SELECT COUNT(*) FROM incidents
             WHERE status = 'resolved' AND updated_at >= date('now')",
            [],
            |row| row.get(0),
        )?;
        let total: i64 =
            conn.query_row("SELECT COUNT(*) FROM incidents", [], |row| row.get(0))?;
        let pending_approval: i64 = conn.query_row(
            "SELECT COUNT(*) FROM remediations WHERE status = 'pending_approval'",
            [],
            |row| row.get(0),
        )?;
        Ok(StatusCounts {
            active_incidents: active as u64,
            resolved_today: resolved_today as u64,
            total_incidents: total as u64,
            pending_approval: pending_approval as u64,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusCounts {
    pub active_incidents: u64,
    pub resolved_today: u64,
    pub total_incidents: u64,
    pub pending_approval: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Incident, MetricKind, ResourceKind, Severity};

    fn test_store() -> (tempfile::TempDir, IncidentStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();
        (dir, IncidentStore::new(pool))
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
    fn incident_round_trip() {
        let (_dir, store) = test_store();
        let incident = sample_incident();
        store.insert_incident(&incident).unwrap();

        let loaded = store.get_incident(incident.id).unwrap().unwrap();
        assert_eq!(loaded.resource_id, "droplet-1");
        assert_eq!(loaded.metric, MetricKind::CpuUsage);
        assert_eq!(loaded.severity, Severity::Critical);
        assert_eq!(loaded.status, IncidentStatus::Detected);
    }

    #[test]
    fn find_open_incident_sees_non_terminal_only() {
        let (_dir, store) = test_store();
        let incident = sample_incident();
        store.insert_incident(&incident).unwrap();

        assert!(store
            .find_open_incident("droplet-1", MetricKind::CpuUsage)
            .unwrap()
            .is_some());
        assert!(store
            .find_open_incident("droplet-1", MetricKind::DiskUsage)
            .unwrap()
            .is_none());

        store
            .set_incident_status(incident.id, IncidentStatus::Diagnosing)
            .unwrap();
        store
            .set_incident_status(incident.id, IncidentStatus::Failed)
            .unwrap();
        assert!(store
            .find_open_incident("droplet-1", MetricKind::CpuUsage)
            .unwrap()
            .is_none());
    }

    #[test]
    fn backward_transitions_are_rejected() {
        let (_dir, store) = test_store();
        let incident = sample_incident();
        store.insert_incident(&incident).unwrap();
        store
            .set_incident_status(incident.id, IncidentStatus::Diagnosed)
            .unwrap();
        assert!(store
            .set_incident_status(incident.id, IncidentStatus::Detected)
            .is_err());
    }

    #[test]
    fn historical_success_rate_defaults_to_half() {
        let (_dir, store) = test_store();
        let rate = store
            .historical_success_rate(RootCauseCategory::UndersizedResource)
            .unwrap();
        assert!((rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn historical_success_rate_counts_terminal_outcomes() {
        let (_dir, store) = test_store();

        for (i, status) in [
            RemediationStatus::Succeeded,
            RemediationStatus::Succeeded,
            RemediationStatus::Failed,
            RemediationStatus::Applying, // in-flight, must not count
        ]
        .iter()
        .enumerate()
        {
            let incident = Incident::new(
                format!("droplet-{i}"),
                "web-app",
                ResourceKind::Droplet,
                MetricKind::CpuUsage,
                90.0,
                80.0,
                Severity::High,
            );
            store.insert_incident(&incident).unwrap();
            let diagnosis = Diagnosis {
                id: Uuid::new_v4(),
                incident_id: incident.id,
                created_at: Utc::now(),
                root_cause: "undersized".into(),
                category: RootCauseCategory::UndersizedResource,
                confidence: 0.9,
                reasoning: "test".into(),
                recommendations: vec![],
                estimated_cost: None,
                estimated_duration_secs: None,
                citations: vec![],
            };
            store.insert_diagnosis(&diagnosis).unwrap();
            let mut remediation = Remediation::new(
                incident.id,
                "doc".into(),
                "resize".into(),
                12.0,
                RiskLevel::Low,
                false,
            );
            remediation.status = *status;
            store.insert_remediation(&remediation).unwrap();
        }

        let rate = store
            .historical_success_rate(RootCauseCategory::UndersizedResource)
            .unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn remediation_update_persists_logs_and_status() {
        let (_dir, store) = test_store();
        let incident = sample_incident();
        store.insert_incident(&incident).unwrap();

        let mut remediation = Remediation::new(
            incident.id,
            "doc".into(),
            "resize droplet".into(),
            12.0,
            RiskLevel::Low,
            false,
        );
        store.insert_remediation(&remediation).unwrap();

        remediation.status = RemediationStatus::Applying;
        remediation.logs.push("applying: started".into());
        store.update_remediation(&remediation).unwrap();

        let loaded = store.get_remediation(remediation.id).unwrap().unwrap();
        assert_eq!(loaded.status, RemediationStatus::Applying);
        assert_eq!(loaded.logs, vec!["applying: started".to_string()]);
    }
}
