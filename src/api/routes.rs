//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use crate::model::provision::{find_template, ProvisionRequest, BUILTIN_TEMPLATES};
use crate::model::{Incident, MetricKind, ResourceKind};
use crate::monitor::classify_severity;
use crate::remediate::RemediateError;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/incidents/detect", post(detect))
        .route("/incidents/diagnose", post(diagnose))
        .route("/incidents/remediate", post(remediate))
        .route("/incidents", get(list_incidents))
        .route("/incidents/{id}", get(get_incident))
        .route("/incidents/{id}/decision", post(decide_remediation))
        .route("/provision/create", post(provision_create))
        .route("/provision/templates", get(list_templates))
        .route("/provision/templates/{id}", get(get_template))
        .route("/demo/inject-failure", post(inject_failure))
}

/// Error payload with the right status code. Internal details stay in the
/// logs, not the response.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!(error = %e, "request failed");
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
    }
}

impl From<RemediateError> for ApiError {
    fn from(e: RemediateError) -> Self {
        match &e {
            RemediateError::Conflict(_) | RemediateError::NotPending(_) => {
                ApiError(StatusCode::CONFLICT, e.to_string())
            }
            RemediateError::IncidentNotFound(_) | RemediateError::RemediationNotFound(_) => {
                ApiError(StatusCode::NOT_FOUND, e.to_string())
            }
            RemediateError::NotDiagnosed(_) => ApiError(StatusCode::BAD_REQUEST, e.to_string()),
            RemediateError::Internal(inner) => {
                tracing::error!(error = %inner, "remediation failed");
                ApiError(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }
    }))
}

async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let status = state.coordinator.status()?;
    Ok(Json(json!({ "data": status })))
}

async fn detect(State(state): State<AppState>) -> Result<Json<Vec<Incident>>, ApiError> {
    let incidents = state.coordinator.detect_now().await?;
    Ok(Json(incidents))
}

#[derive(Deserialize)]
struct DiagnoseBody {
    incident_id: Uuid,
}

async fn diagnose(
    State(state): State<AppState>,
    Json(body): Json<DiagnoseBody>,
) -> Result<Response, ApiError> {
    let diagnosis = state.coordinator.diagnose(body.incident_id).await?;
    Ok(Json(diagnosis).into_response())
}

#[derive(Deserialize)]
struct RemediateBody {
    incident_id: Uuid,
    #[serde(default)]
    auto_approve: bool,
}

async fn remediate(
    State(state): State<AppState>,
    Json(body): Json<RemediateBody>,
) -> Result<Response, ApiError> {
    let remediation = state
        .coordinator
        .remediate(body.incident_id, body.auto_approve)
        .await?;
    Ok(Json(remediation).into_response())
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_incidents(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let store = state.coordinator.store();
    let incidents = store.list_incidents(query.limit)?;
    let total = incidents.len();
    let mut rows = Vec::with_capacity(total);
    for incident in incidents {
        let has_diagnosis = store.latest_diagnosis(incident.id)?.is_some();
        let has_remediation = store.latest_remediation(incident.id)?.is_some();
        rows.push(json!({
            "incident": incident,
            "has_diagnosis": has_diagnosis,
            "has_remediation": has_remediation,
        }));
    }
    Ok(Json(json!({
        "data": rows,
        "meta": { "total": total }
    })))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let store = state.coordinator.store();
    let Some(incident) = store.get_incident(id)? else {
        return Err(ApiError(StatusCode::NOT_FOUND, format!("incident {id} not found")));
    };
    let diagnosis = store.latest_diagnosis(id)?;
    let remediation = store.latest_remediation(id)?;
    Ok(Json(json!({
        "data": {
            "incident": incident,
            "diagnosis": diagnosis,
            "remediation": remediation,
        }
    })))
}

#[derive(Deserialize)]
struct DecisionBody {
    approve: bool,
}

async fn decide_remediation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> Result<Response, ApiError> {
    let Some(remediation) = state.coordinator.store().latest_remediation(id)? else {
        return Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("no remediation recorded for incident {id}"),
        ));
    };
    let updated = state
        .coordinator
        .decide_remediation(remediation.id, body.approve)
        .await?;
    Ok(Json(updated).into_response())
}

#[derive(Deserialize)]
struct ProvisionQuery {
    #[serde(default)]
    project_id: Option<String>,
}

async fn provision_create(
    State(state): State<AppState>,
    Query(query): Query<ProvisionQuery>,
    Json(request): Json<ProvisionRequest>,
) -> Json<Value> {
    if let Some(project) = &query.project_id {
        tracing::info!(request = %request.id, project, "provisioning for project");
    }
    let result = state.coordinator.provision(&request).await;
    Json(serde_json::to_value(result).unwrap_or(Value::Null))
}

async fn list_templates() -> Json<Value> {
    Json(json!({
        "data": BUILTIN_TEMPLATES,
        "meta": { "total": BUILTIN_TEMPLATES.len() }
    }))
}

async fn get_template(Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    match find_template(&id) {
        Some(template) => Ok(Json(json!({ "data": template }))),
        None => Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("template '{id}' not found"),
        )),
    }
}

#[derive(Deserialize)]
struct InjectBody {
    #[serde(default = "default_inject_resource")]
    resource_name: String,
    #[serde(default = "default_inject_metric")]
    metric: String,
    #[serde(default = "default_inject_value")]
    current_value: f64,
    #[serde(default = "default_inject_threshold")]
    threshold_value: f64,
}

fn default_inject_resource() -> String {
    "demo-droplet".to_string()
}
fn default_inject_metric() -> String {
    "cpu_usage".to_string()
}
fn default_inject_value() -> f64 {
    95.0
}
fn default_inject_threshold() -> f64 {
    80.0
}

/// Create a synthetic incident so the full pipeline can be exercised without
/// a breaching fleet.
async fn inject_failure(
    State(state): State<AppState>,
    Json(body): Json<InjectBody>,
) -> Result<Json<Incident>, ApiError> {
    let metric = MetricKind::parse(&body.metric);
    let Some(severity) =
        classify_severity(metric, body.current_value, body.threshold_value, false)
    else {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "values do not describe a breach".to_string(),
        ));
    };

    let mut incident = Incident::new(
        format!("demo-{}", &Uuid::new_v4().to_string()[..8]),
        body.resource_name,
        ResourceKind::Droplet,
        metric,
        body.current_value,
        body.threshold_value,
        severity,
    );
    incident.metadata = json!({ "detection_method": "injected", "resource_size": "s-1vcpu-1gb" });

    state.coordinator.store().insert_incident(&incident)?;
    state
        .coordinator
        .events()
        .publish(crate::events::LifecycleEvent::IncidentDetected {
            incident_id: incident.id,
        });
    Ok(Json(incident))
}
