//! Control API.
//!
//! A slim HTTP surface over the engine: playbook catalog, execution
//! submission and inspection, credential management, and the worker
//! registry. Everything user-visible is derived from the event log.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use floe_core::engine::state::WorkflowState;
use floe_core::event::Event;
use floe_store::{CatalogEntry, CredentialInfo, EventLog, PlaybookCatalog};

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::submission::{self, SubmitRequest};

/// Build the control API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/catalog", post(register_playbook))
        .route("/api/catalog", get(get_playbook))
        .route("/api/catalog/list", get(list_playbooks))
        .route("/api/executions", post(submit_execution))
        .route("/api/executions/{execution_id}", get(get_execution))
        .route(
            "/api/executions/{execution_id}/status",
            get(get_execution_status),
        )
        .route(
            "/api/executions/{execution_id}/events",
            get(get_execution_events),
        )
        .route(
            "/api/executions/{execution_id}/cancel",
            post(cancel_execution),
        )
        .route("/api/credentials", get(list_credentials))
        .route("/api/credentials/{name}", put(put_credential))
        .route("/api/credentials/{name}", delete(delete_credential))
        .route("/api/workers/register", post(register_worker))
        .route("/api/workers/heartbeat", post(worker_heartbeat))
        .route("/api/workers/deregister", post(deregister_worker))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// ---------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterPlaybookRequest {
    path: String,
    content: String,
}

async fn register_playbook(
    State(state): State<AppState>,
    Json(request): Json<RegisterPlaybookRequest>,
) -> AppResult<(StatusCode, Json<CatalogEntry>)> {
    // Reject invalid playbooks at the door.
    floe_core::playbook::parse(&request.content)?;

    let entry = state
        .store
        .register(&request.path, &request.content)
        .await?;
    tracing::info!(path = %entry.path, version = entry.version, "Playbook registered");
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
struct PlaybookQuery {
    path: String,
    version: Option<i32>,
}

async fn get_playbook(
    State(state): State<AppState>,
    Query(query): Query<PlaybookQuery>,
) -> AppResult<Json<CatalogEntry>> {
    let entry = state
        .store
        .fetch(&query.path, query.version)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Playbook not found: {}", query.path)))?;
    Ok(Json(entry))
}

async fn list_playbooks(State(state): State<AppState>) -> AppResult<Json<Vec<CatalogEntry>>> {
    Ok(Json(state.store.list().await?))
}

// ---------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SubmitResponse {
    execution_id: i64,
}

async fn submit_execution(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    let execution_id = submission::submit(state.store.as_ref(), &request, None).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { execution_id })))
}

async fn load_state(state: &AppState, execution_id: i64) -> AppResult<(WorkflowState, Vec<Event>)> {
    let events = state.store.range(execution_id, None).await?;
    let snapshot = WorkflowState::from_events(&events)
        .ok_or_else(|| AppError::NotFound(format!("Execution not found: {}", execution_id)))?;
    Ok((snapshot, events))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> AppResult<Json<WorkflowState>> {
    let (snapshot, _) = load_state(&state, execution_id).await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Serialize)]
struct ExecutionStatusResponse {
    execution_id: i64,
    status: String,
    total_steps: usize,
    completed_steps: usize,
    running_steps: usize,
    failed_steps: usize,
    event_count: usize,
}

async fn get_execution_status(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> AppResult<Json<ExecutionStatusResponse>> {
    let (snapshot, events) = load_state(&state, execution_id).await?;

    let completed = snapshot
        .steps
        .values()
        .filter(|s| s.state == floe_core::engine::state::StepState::Completed)
        .count();
    let failed = snapshot.failed_steps().len();
    let running = snapshot.live_steps().len();

    Ok(Json(ExecutionStatusResponse {
        execution_id,
        status: snapshot.state.to_string(),
        total_steps: snapshot.steps.len(),
        completed_steps: completed,
        running_steps: running,
        failed_steps: failed,
        event_count: events.len(),
    }))
}

async fn get_execution_events(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> AppResult<Json<Vec<Event>>> {
    let events = state.store.range(execution_id, None).await?;
    if events.is_empty() {
        return Err(AppError::NotFound(format!(
            "Execution not found: {}",
            execution_id
        )));
    }
    Ok(Json(events))
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    submission::cancel(state.store.as_ref(), execution_id).await?;
    Ok(Json(
        serde_json::json!({"execution_id": execution_id, "status": "cancelled"}),
    ))
}

// ---------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PutCredentialRequest {
    kind: String,
    fields: HashMap<String, String>,
}

async fn put_credential(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<PutCredentialRequest>,
) -> AppResult<StatusCode> {
    state
        .credentials
        .put(&name, &request.kind, &request.fields)
        .await?;
    tracing::info!(name = %name, kind = %request.kind, "Credential stored");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_credentials(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<CredentialInfo>>> {
    Ok(Json(state.credentials.list().await?))
}

async fn delete_credential(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<StatusCode> {
    state.credentials.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------
// Worker registry
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WorkerRequest {
    worker_id: String,
    #[serde(default)]
    pool_name: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    capacity: Option<i32>,
}

async fn register_worker(
    State(state): State<AppState>,
    Json(request): Json<WorkerRequest>,
) -> AppResult<StatusCode> {
    state
        .store
        .register_worker(
            &request.worker_id,
            request.pool_name.as_deref().unwrap_or("default"),
            request.hostname.as_deref(),
            request.capacity,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(request): Json<WorkerRequest>,
) -> AppResult<StatusCode> {
    state.store.worker_heartbeat(&request.worker_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deregister_worker(
    State(state): State<AppState>,
    Json(request): Json<WorkerRequest>,
) -> AppResult<StatusCode> {
    state.store.deregister_worker(&request.worker_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
