use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use weir_core::error::WeirError;
use weir_core::types::{
    ApprovalDecision, ApprovalId, RunId, RunView, TriggerKind, WorkflowDefinition,
};
use weir_engine::dag;
use weir_engine::run_log::log_path;

use crate::middleware::Authenticated;
use crate::state::AppState;

/// Maps engine errors onto HTTP statuses. The body always carries the
/// message so callers see why a request was refused.
pub struct ApiError(WeirError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WeirError::NotFound(_) => StatusCode::NOT_FOUND,
            WeirError::Validation(_) | WeirError::Cycle { .. } | WeirError::UnknownAgent(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<WeirError> for ApiError {
    fn from(e: WeirError) -> Self {
        Self(e)
    }
}

// GET /api/health (the only unauthenticated route)
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// POST /api/workflows
pub async fn put_workflow(
    _: Authenticated,
    State(state): State<Arc<AppState>>,
    Json(def): Json<WorkflowDefinition>,
) -> Result<Json<Value>, ApiError> {
    dag::validate(&def)?;
    state.store.put_workflow(&def).await?;
    info!(workflow_id = %def.id, version = def.version, "Workflow registered");
    Ok(Json(json!({ "id": def.id, "version": def.version })))
}

// GET /api/workflows/{id}
pub async fn get_workflow(
    _: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let def = state.store.get_workflow(&id).await?;
    Ok(Json(def))
}

#[derive(Deserialize)]
pub struct TriggerRunBody {
    pub workflow_id: String,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub trigger_kind: Option<TriggerKind>,
}

// POST /api/runs
pub async fn trigger_run(
    _: Authenticated,
    State(state): State<Arc<AppState>>,
    Json(body): Json<TriggerRunBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let def = state.store.get_workflow(&body.workflow_id).await?;
    let context = body.context.unwrap_or(Value::Null);
    let kind = body.trigger_kind.unwrap_or(TriggerKind::Manual);
    let run_id = state.engine.trigger_run(&def, context, kind).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))))
}

#[derive(Deserialize)]
pub struct ListRunsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/runs?limit=50
pub async fn list_runs(
    _: Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListRunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let runs = state.store.list_runs(q.limit).await?;
    Ok(Json(json!({ "runs": runs })))
}

// GET /api/runs/{id}
pub async fn get_run(
    _: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunView>, ApiError> {
    let view = state.engine.get_run(&RunId::from_str(&id)).await?;
    Ok(Json(view))
}

// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    _: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let run_id = RunId::from_str(&id);
    state.engine.cancel_run(&run_id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))))
}

// POST /api/runs/{id}/retry
pub async fn retry_run(
    _: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let new_id = state.engine.retry_run(&RunId::from_str(&id)).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": new_id }))))
}

// GET /api/runs/{id}/log (JSONL, one event per line)
pub async fn get_run_log(
    _: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let run_id = RunId::from_str(&id);
    let path = log_path(&state.log_dir, &run_id);
    let body = match tokio::fs::read_to_string(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError(WeirError::NotFound(format!(
                "no event log for run '{}'",
                run_id
            ))));
        }
        Err(e) => return Err(ApiError(e.into())),
    };
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

// GET /api/approvals
pub async fn list_approvals(
    _: Authenticated,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let approvals = state.store.pending_approvals().await?;
    Ok(Json(json!({ "approvals": approvals })))
}

// POST /api/approvals/{id}
pub async fn decide_approval(
    _: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<Json<Value>, ApiError> {
    let approval_id = ApprovalId::from_str(&id);
    info!(
        approval_id = %approval_id,
        decided_by = decision.decided_by(),
        approved = decision.is_approved(),
        "Approval decision received"
    );
    state.engine.resume_approval(&approval_id, decision).await?;
    Ok(Json(json!({ "approval_id": approval_id })))
}
