// Route handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::time::Duration;
use uuid::Uuid;

use super::types::{
    unprocessable, ApiError, ChatRequest, ChatResponse, EvolveAccepted, EvolveRequest,
    HealthResponse, SessionCreateRequest,
};
use super::AppState;
use crate::evolve::{EvolveSpec, TaskStatus};
use crate::gateway::InvocationRequest;
use crate::session::{Message, Role, SessionSummary};

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        tool_available: state.gateway.health_check().await,
    })
}

pub async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, Response> {
    if request.prompt.trim().is_empty() {
        return Err(unprocessable("prompt must not be empty"));
    }

    // Resolve tier and capabilities: request override, then session, then
    // configured defaults. The gateway still enforces no-widening.
    let session = match request.session_id {
        Some(id) => Some(
            state
                .sessions
                .get(id)
                .ok_or_else(|| ApiError(crate::error::CoreError::SessionNotFound(id)).into_response())?,
        ),
        None => None,
    };

    let primary_tier = request
        .tier
        .clone()
        .or_else(|| session.as_ref().map(|s| s.primary_tier.clone()))
        .unwrap_or_else(|| state.tool.primary_tier.clone());
    let fallback_tier = session
        .as_ref()
        .and_then(|s| s.fallback_tier.clone())
        .or_else(|| state.tool.fallback_tier.clone());
    let capabilities = request
        .capabilities
        .clone()
        .or_else(|| session.as_ref().map(|s| s.capabilities.clone()))
        .unwrap_or_else(|| state.tool.default_capabilities.clone());
    let working_dir = request
        .working_dir
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let invocation = InvocationRequest {
        prompt: request.prompt.clone(),
        session_id: request.session_id,
        primary_tier: primary_tier.clone(),
        fallback_tier,
        capabilities,
        required: vec![],
        working_dir,
        timeout: Duration::from_secs(state.tool.timeout_secs),
    };

    // Record the caller's side first so history reads caller -> assistant.
    if let Some(id) = request.session_id {
        state
            .sessions
            .append(id, Message::new(Role::Caller, &request.prompt, &primary_tier))
            .map_err(|e| ApiError(e).into_response())?;
    }

    let result = state
        .gateway
        .invoke(invocation)
        .await
        .map_err(|e| ApiError(e).into_response())?;

    Ok(Json(ChatResponse {
        content: result.content,
        tier_used: result.tier_used,
        usage: result.usage,
        duration_ms: result.duration_ms,
        session_id: request.session_id,
    }))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<SessionCreateRequest>,
) -> (StatusCode, Json<SessionSummary>) {
    let session = state.sessions.create(
        request.name,
        request.working_dir,
        request
            .capabilities
            .unwrap_or_else(|| state.tool.default_capabilities.clone()),
        request
            .tier
            .unwrap_or_else(|| state.tool.primary_tier.clone()),
        request.fallback_tier.or_else(|| state.tool.fallback_tier.clone()),
    );
    (StatusCode::CREATED, Json(session.to_summary()))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list())
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .sessions
        .get(id)
        .ok_or(crate::error::CoreError::SessionNotFound(id))?;
    let history = state.sessions.history(id)?;
    Ok(Json(serde_json::json!({
        "id": session.id,
        "name": session.name,
        "working_dir": session.working_dir,
        "capabilities": session.capabilities,
        "primary_tier": session.primary_tier,
        "fallback_tier": session.fallback_tier,
        "usage": session.usage,
        "created_at": session.created_at,
        "last_accessed": session.last_accessed,
        "history": history,
    })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.sessions.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn submit_evolution(
    State(state): State<AppState>,
    Json(request): Json<EvolveRequest>,
) -> Result<(StatusCode, Json<EvolveAccepted>), Response> {
    if request.objective.trim().is_empty() {
        return Err(unprocessable("objective must not be empty"));
    }
    if request.verify_command.trim().is_empty() {
        return Err(unprocessable("verify_command must not be empty"));
    }
    if request.max_iterations == 0 {
        return Err(unprocessable("max_iterations must be at least 1"));
    }
    if request.max_iterations > state.evolve.max_iterations_cap {
        return Err(unprocessable(format!(
            "max_iterations exceeds the configured cap of {}",
            state.evolve.max_iterations_cap
        )));
    }

    let spec = EvolveSpec {
        target_path: request.target_path,
        objective: request.objective,
        verify_command: request.verify_command,
        max_iterations: request.max_iterations,
        session_id: request.session_id,
        capabilities: request.capabilities,
        tier: request.tier,
        context_mode: request.context_mode,
    };

    let task_id = state
        .registry
        .submit(spec)
        .await
        .map_err(|e| ApiError(e).into_response())?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EvolveAccepted {
            task_id,
            status: TaskStatus::Pending,
        }),
    ))
}

pub async fn list_evolutions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

pub async fn get_evolution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.detail(id).await?))
}

pub async fn cancel_evolution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.cancel(id).await?;
    Ok(Json(state.registry.status(id).await?))
}

pub async fn remove_evolution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.registry.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
