//! Route handlers: request decoding, delegation to the Run/Session
//! managers, and single-body vs SSE response selection.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::domain::error::{self, BridgeError};
use crate::domain::message::Message;
use crate::domain::run::{Run, RunMode, RunStatus, TurnContent};
use crate::domain::session::Session;

use super::AppState;
use super::error::ApiError;
use super::sse::stream_updates;

#[derive(Serialize)]
pub struct PingResponse {
    status: &'static str,
}

pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse { status: "ok" })
}

#[derive(Serialize)]
pub struct AgentManifest {
    name: String,
    description: String,
}

#[derive(Serialize)]
pub struct AgentsListResponse {
    agents: Vec<AgentManifest>,
}

pub async fn list_agents(State(state): State<AppState>) -> Json<AgentsListResponse> {
    let agents = state
        .registry
        .list()
        .map(|spec| AgentManifest { name: spec.name.clone(), description: spec.description.clone() })
        .collect();
    Json(AgentsListResponse { agents })
}

pub async fn get_agent(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<AgentManifest>, ApiError> {
    let spec = state.registry.get(&name).ok_or_else(|| BridgeError::AgentNotFound(name.clone()))?;
    Ok(Json(AgentManifest { name: spec.name.clone(), description: spec.description.clone() }))
}

#[derive(Deserialize)]
pub struct CreateRunRequest {
    agent: String,
    session_id: Option<String>,
    mode: RunMode,
    input: TurnContent,
}

#[derive(Serialize)]
struct SyncRunResponse {
    run_id: String,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<TurnContent>,
}

pub async fn create_run(State(state): State<AppState>, Json(request): Json<CreateRunRequest>) -> Response {
    let CreateRunRequest { agent, session_id, mode, input } = request;

    let (run_id, event_rx) = match state.runs.create_run(agent, session_id, mode, input).await {
        Ok(created) => created,
        Err(err) => return ApiError(err).into_response(),
    };

    match mode {
        RunMode::Stream => stream_updates(event_rx).into_response(),
        RunMode::Sync => await_sync_result(state, run_id, event_rx).await,
    }
}

async fn await_sync_result(
    state: AppState,
    run_id: String,
    mut event_rx: tokio::sync::mpsc::UnboundedReceiver<crate::domain::run::UpdateEvent>,
) -> Response {
    while event_rx.recv().await.is_some() {}

    let Some(run) = state.runs.get_run(&run_id).await else {
        return ApiError(BridgeError::Internal("run vanished from the in-memory table".into())).into_response();
    };

    render_run_terminal_state(&run)
}

fn render_run_terminal_state(run: &Run) -> Response {
    match run.status {
        RunStatus::Completed => {
            Json(SyncRunResponse { run_id: run.id.clone(), status: run.status, output: run.result.clone() })
                .into_response()
        }
        RunStatus::Cancelled => {
            Json(SyncRunResponse { run_id: run.id.clone(), status: run.status, output: None }).into_response()
        }
        RunStatus::Failed => {
            let Some(run_error) = &run.error else {
                return ApiError(BridgeError::Internal("failed run missing error payload".into())).into_response();
            };
            let status = StatusCode::from_u16(error::status_code_for_kind(&run_error.kind))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(serde_json::json!({ "error": { "kind": run_error.kind, "message": run_error.message } })))
                .into_response()
        }
        RunStatus::Created | RunStatus::InProgress => {
            ApiError(BridgeError::Internal("run channel closed before reaching a terminal state".into()))
                .into_response()
        }
    }
}

#[derive(Serialize)]
struct CancelResponse {
    run_id: String,
    status: RunStatus,
}

pub async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Result<Json<CancelResponse>, ApiError> {
    let run = state.runs.cancel(&run_id).await?;
    Ok(Json(CancelResponse { run_id: run.id, status: run.status }))
}

#[derive(Serialize)]
struct SessionsListResponse {
    sessions: Vec<Session>,
}

pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<SessionsListResponse>, ApiError> {
    let sessions = state.store.list_sessions(100, 0).await?;
    Ok(Json(SessionsListResponse { sessions }))
}

#[derive(Serialize)]
struct SessionDetailResponse {
    session: Session,
    messages: Vec<Message>,
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let session = state
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| BridgeError::NotFound(format!("session `{session_id}`")))?;
    let messages = state.store.list_messages(&session_id, None, None).await?;
    Ok(Json(SessionDetailResponse { session, messages }))
}

pub async fn delete_session(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<StatusCode, ApiError> {
    state.sessions.terminate(&session_id).await;
    let deleted = state.store.delete_session(&session_id).await?;
    if deleted { Ok(StatusCode::NO_CONTENT) } else { Err(ApiError(BridgeError::NotFound(format!("session `{session_id}`")))) }
}
