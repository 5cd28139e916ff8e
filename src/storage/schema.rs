//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            detected_at TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            resource_name TEXT NOT NULL,
            resource_kind TEXT NOT NULL,
            metric TEXT NOT NULL,
            current_value REAL NOT NULL,
            threshold_value REAL NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL,
            description TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_incidents_open
            ON incidents (resource_id, metric, status);

        CREATE TABLE IF NOT EXISTS diagnoses (
            id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL REFERENCES incidents(id),
            created_at TEXT NOT NULL,
            root_cause TEXT NOT NULL,
            category TEXT NOT NULL,
            confidence REAL NOT NULL,
            reasoning TEXT NOT NULL,
            recommendations_json TEXT NOT NULL DEFAULT '[]',
            estimated_cost REAL,
            estimated_duration_secs INTEGER,
            citations_json TEXT NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_diagnoses_incident
            ON diagnoses (incident_id, created_at);

        CREATE TABLE IF NOT EXISTS remediations (
            id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL REFERENCES incidents(id),
            created_at TEXT NOT NULL,
            document TEXT NOT NULL,
            action_summary TEXT NOT NULL,
            cost_delta REAL NOT NULL,
            risk TEXT NOT NULL,
            requires_approval INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            logs_json TEXT NOT NULL DEFAULT '[]',
            verification_passed INTEGER NOT NULL DEFAULT 0,
            rollback_executed INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            duration_secs REAL NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_remediations_incident
            ON remediations (incident_id, created_at);

        CREATE TABLE IF NOT EXISTS provision_results (
            request_id TEXT PRIMARY KEY,
            requester TEXT NOT NULL,
            description TEXT NOT NULL,
            success INTEGER NOT NULL,
            resources_json TEXT NOT NULL DEFAULT '[]',
            cost_estimate REAL,
            document TEXT,
            error TEXT,
            validation_errors_json TEXT NOT NULL DEFAULT '[]',
            logs_json TEXT NOT NULL DEFAULT '[]',
            completed_at TEXT NOT NULL,
            duration_secs REAL NOT NULL DEFAULT 0
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}
