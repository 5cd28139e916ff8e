//! Coordinator -- the top-level control loop wiring monitor, diagnostic
//! engine, safety gate, and remediation executor together.
//!
//! The scheduling loop is single-threaded; per-incident work fans out as
//! independent tasks bounded by a worker-pool semaphore. There is no global
//! mutable state: every component gets its handles by injection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clients::knowledge::KnowledgeBase;
use crate::diagnose::DiagnosticEngine;
use crate::events::{EventBus, LifecycleEvent};
use crate::model::provision::{ProvisionRequest, ProvisionResult};
use crate::model::{Diagnosis, Incident, Remediation};
use crate::monitor::Monitor;
use crate::provision::Provisioner;
use crate::remediate::{RemediateError, RemediationExecutor};
use crate::storage::{IncidentStore, StatusCounts};

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub counts: StatusCounts,
    pub auto_remediation: bool,
    pub confidence_threshold: f64,
    pub poll_interval_secs: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_scan_ok: bool,
}

pub struct Coordinator {
    monitor: Arc<Monitor>,
    engine: Arc<DiagnosticEngine>,
    executor: Arc<RemediationExecutor>,
    provisioner: Arc<Provisioner>,
    knowledge: Arc<dyn KnowledgeBase>,
    store: IncidentStore,
    events: EventBus,
    confidence_threshold: f64,
    auto_remediation: bool,
    poll_interval: Duration,
    workers: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    last_scan: Mutex<(Option<DateTime<Utc>>, bool)>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        monitor: Arc<Monitor>,
        engine: Arc<DiagnosticEngine>,
        executor: Arc<RemediationExecutor>,
        provisioner: Arc<Provisioner>,
        knowledge: Arc<dyn KnowledgeBase>,
        store: IncidentStore,
        events: EventBus,
        confidence_threshold: f64,
        auto_remediation: bool,
        poll_interval: Duration,
        worker_limit: usize,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        let shutdown_rx = shutdown_tx.subscribe();
        Self {
            monitor,
            engine,
            executor,
            provisioner,
            knowledge,
            store,
            events,
            confidence_threshold,
            auto_remediation,
            poll_interval,
            workers: Arc::new(Semaphore::new(worker_limit)),
            shutdown_tx,
            shutdown_rx,
            last_scan: Mutex::new((None, false)),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &IncidentStore {
        &self.store
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// The periodic scheduling loop. Scan failures are logged and the cycle
    /// skipped; the loop itself never crashes.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            auto_remediation = self.auto_remediation,
            "coordinator loop started"
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("coordinator loop stopping");
                    return;
                }
            }

            match self.detect_now().await {
                Ok(incidents) => {
                    for incident in incidents {
                        Arc::clone(&self).spawn_pipeline(incident);
                    }
                }
                Err(e) => {
                    error!(error = %e, "scan cycle failed, skipping");
                }
            }
        }
    }

    /// One synchronous monitor scan. Publishes an event per new incident.
    pub async fn detect_now(&self) -> Result<Vec<Incident>> {
        let result = self.monitor.scan().await;
        if let Ok(mut scan) = self.last_scan.lock() {
            *scan = (Some(Utc::now()), result.is_ok());
        }
        let incidents = result?;
        for incident in &incidents {
            self.events.publish(LifecycleEvent::IncidentDetected {
                incident_id: incident.id,
            });
        }
        Ok(incidents)
    }

    /// Fan one incident's diagnose -> remediate pipeline out as a bounded
    /// concurrent task. Per incident the stages stay strictly sequential;
    /// across incidents there is no ordering.
    fn spawn_pipeline(self: Arc<Self>, incident: Incident) {
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire().await else {
                return; // pool closed during shutdown
            };
            if let Err(e) = self.handle_incident(incident.id).await {
                error!(incident = %incident.id, error = %e, "incident pipeline failed");
            }
        });
    }

    async fn handle_incident(&self, incident_id: Uuid) -> Result<()> {
        let diagnosis = self.diagnose(incident_id).await?;

        // Low confidence is a policy escalation, not an error: the incident
        // stays diagnosed for a human regardless of what the safety gate
        // would say.
        if diagnosis.confidence < self.confidence_threshold {
            info!(
                incident = %incident_id,
                confidence = diagnosis.confidence,
                threshold = self.confidence_threshold,
                "confidence below threshold, escalating to human review"
            );
            return Ok(());
        }
        if !self.auto_remediation {
            info!(incident = %incident_id, "auto-remediation disabled, leaving diagnosed");
            return Ok(());
        }

        match self.remediate(incident_id, false).await {
            Ok(_) => Ok(()),
            Err(RemediateError::Conflict(_)) => {
                warn!(incident = %incident_id, "remediation already active, skipping");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn diagnose(&self, incident_id: Uuid) -> Result<Diagnosis> {
        let diagnosis = self.engine.diagnose(incident_id).await?;
        self.events.publish(LifecycleEvent::DiagnosisCompleted {
            incident_id,
            diagnosis_id: diagnosis.id,
        });
        Ok(diagnosis)
    }

    pub async fn remediate(
        &self,
        incident_id: Uuid,
        auto_approve: bool,
    ) -> Result<Remediation, RemediateError> {
        let remediation = self.executor.execute(incident_id, auto_approve).await?;
        if remediation.status.is_terminal() {
            self.events.publish(LifecycleEvent::RemediationCompleted {
                incident_id,
                remediation_id: remediation.id,
            });
            self.record_resolution(&remediation).await;
        }
        Ok(remediation)
    }

    /// Resolve a pending-approval remediation (approve or reject).
    pub async fn decide_remediation(
        &self,
        remediation_id: Uuid,
        approve: bool,
    ) -> Result<Remediation, RemediateError> {
        let remediation = self.executor.decide(remediation_id, approve).await?;
        if remediation.status.is_terminal() {
            self.events.publish(LifecycleEvent::RemediationCompleted {
                incident_id: remediation.incident_id,
                remediation_id: remediation.id,
            });
            self.record_resolution(&remediation).await;
        }
        Ok(remediation)
    }

    /// Feed the outcome back into the knowledge base so future diagnoses of
    /// the same category can retrieve it. Failures are logged, never fatal.
    async fn record_resolution(&self, remediation: &Remediation) {
        let (incident, diagnosis) = match (
            self.store.get_incident(remediation.incident_id),
            self.store.latest_diagnosis(remediation.incident_id),
        ) {
            (Ok(Some(i)), Ok(Some(d))) => (i, d),
            _ => return,
        };
        let entry = format!(
            "Incident resolution record\n\
             Incident: {}\n\
             Resource: {} ({})\n\
             Metric: {} = {:.2} (threshold {:.2})\n\
             Root cause: {} [{}] (confidence {:.2})\n\
             Action: {}\n\
             Outcome: {} (verification {})",
            incident.description,
            incident.resource_name,
            incident.resource_kind.as_str(),
            incident.metric.as_str(),
            incident.current_value,
            incident.threshold_value,
            diagnosis.root_cause,
            diagnosis.category.as_str(),
            diagnosis.confidence,
            remediation.action_summary,
            remediation.status.as_str(),
            if remediation.verification_passed {
                "passed"
            } else {
                "failed"
            },
        );
        if let Err(e) = self.knowledge.record(&entry).await {
            warn!(incident = %remediation.incident_id, error = %e, "knowledge base record failed");
        }
    }

    pub async fn provision(&self, request: &ProvisionRequest) -> ProvisionResult {
        self.events.publish(LifecycleEvent::ProvisionStarted {
            request_id: request.id,
        });
        let result = self.provisioner.provision(request).await;
        self.events.publish(LifecycleEvent::ProvisionComplete {
            request_id: request.id,
            success: result.success,
        });
        result
    }

    pub fn status(&self) -> Result<SystemStatus> {
        let counts = self.store.status_counts()?;
        let (last_scan_at, last_scan_ok) = self
            .last_scan
            .lock()
            .map(|s| *s)
            .unwrap_or((None, false));
        Ok(SystemStatus {
            counts,
            auto_remediation: self.auto_remediation,
            confidence_threshold: self.confidence_threshold,
            poll_interval_secs: self.poll_interval.as_secs(),
            last_scan_at,
            last_scan_ok,
        })
    }
}
