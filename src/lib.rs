//! InfraMedic -- autonomous incident response and provisioning for cloud
//! fleets.
//!
//! This crate provides the core library: fleet monitoring, root-cause
//! diagnosis, safety-gated remediation, and natural-language provisioning.

pub mod api;
pub mod clients;
pub mod config;
pub mod diagnose;
pub mod events;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod provision;
pub mod remediate;
pub mod safety;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use crate::clients::cloud::{CloudResources, HttpCloudClient};
use crate::clients::iac::{CommandIacRunner, IacRunner};
use crate::clients::knowledge::{HttpKnowledgeClient, KnowledgeBase};
use crate::clients::metrics::{HttpMetricsClient, MetricsQuery};
use crate::clients::reasoning::{HttpReasoningClient, Reasoning};
use crate::config::Config;
use crate::diagnose::DiagnosticEngine;
use crate::events::EventBus;
use crate::monitor::Monitor;
use crate::orchestrator::Coordinator;
use crate::provision::Provisioner;
use crate::remediate::RemediationExecutor;
use crate::safety::SafetyValidator;
use crate::storage::IncidentStore;

/// Wire every component together against the HTTP/subprocess collaborator
/// implementations. Components receive their handles by injection; nothing
/// is global.
pub fn build_coordinator(config: &Config) -> Result<Arc<Coordinator>> {
    tracing::info!(db_path = %config.db_path, "initializing database");
    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let pool = storage::open_pool(&config.db_path)?;
    let store = IncidentStore::new(pool);

    let c = &config.collaborators;
    let timeout = c.request_timeout();
    let cloud: Arc<dyn CloudResources> = Arc::new(HttpCloudClient::new(
        &c.cloud_api,
        &c.cloud_token,
        &c.cloud_tag,
        timeout,
    ));
    let metrics: Arc<dyn MetricsQuery> = Arc::new(HttpMetricsClient::new(&c.metrics_api, timeout));
    let knowledge: Arc<dyn KnowledgeBase> =
        Arc::new(HttpKnowledgeClient::new(&c.knowledge_api, timeout));
    let reasoning: Arc<dyn Reasoning> = Arc::new(HttpReasoningClient::new(
        &c.reasoning_api,
        &c.reasoning_key,
        timeout,
    ));
    // Applies can legitimately take minutes.
    let iac: Arc<dyn IacRunner> = Arc::new(CommandIacRunner::new(
        &c.iac_binary,
        &c.iac_workdir,
        Duration::from_secs(300),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Arc::new(Monitor::new(
        Arc::clone(&cloud),
        Arc::clone(&metrics),
        store.clone(),
        config.thresholds.clone(),
    ));
    let engine = Arc::new(DiagnosticEngine::new(
        Arc::clone(&knowledge),
        Arc::clone(&metrics),
        Arc::clone(&cloud),
        Arc::clone(&reasoning),
        store.clone(),
    ));
    let executor = Arc::new(
        RemediationExecutor::new(
            Arc::clone(&reasoning),
            Arc::clone(&iac),
            Arc::clone(&metrics),
            SafetyValidator::new(config.cost_ceiling),
            store.clone(),
            config.verification.clone(),
        )
        .with_shutdown(shutdown_rx),
    );
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&reasoning),
        Arc::clone(&iac),
        SafetyValidator::new(config.cost_ceiling),
        store.clone(),
    ));

    Ok(Arc::new(Coordinator::new(
        monitor,
        engine,
        executor,
        provisioner,
        knowledge,
        store,
        EventBus::default(),
        config.confidence_threshold,
        config.auto_remediation,
        config.poll_interval(),
        config.worker_limit,
        shutdown_tx,
    )))
}

/// Start the InfraMedic daemon: API server plus the coordinator loop.
pub async fn serve(bind: &str, config: Config) -> Result<()> {
    let coordinator = build_coordinator(&config)?;

    tokio::spawn(Arc::clone(&coordinator).run());

    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(api::state::AppState {
        coordinator: Arc::clone(&coordinator),
    });

    tracing::info!(%addr, "inframedic listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await?;

    Ok(())
}

async fn shutdown_signal(coordinator: Arc<Coordinator>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    // In-flight remediations past their apply point still run to a terminal
    // state; the loop stops scheduling new work.
    coordinator.shutdown();
}
