// HTTP request/response payloads and error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::CoreError;
use crate::evolve::IterationContext;
use crate::gateway::{Capability, TokenUsage};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// Tier override; defaults to the session's or configured tier.
    #[serde(default)]
    pub tier: Option<String>,
    /// Capability grant; defaults to the session's set or the configured
    /// default for sessionless calls.
    #[serde(default)]
    pub capabilities: Option<Vec<Capability>>,
    /// Working directory for a sessionless call.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub content: String,
    pub tier_used: String,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SessionCreateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub capabilities: Option<Vec<Capability>>,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub fallback_tier: Option<String>,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize)]
pub struct EvolveRequest {
    pub target_path: PathBuf,
    pub objective: String,
    pub verify_command: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub capabilities: Option<Vec<Capability>>,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub context_mode: IterationContext,
}

fn default_max_iterations() -> u32 {
    5
}

#[derive(Debug, Serialize)]
pub struct EvolveAccepted {
    pub task_id: Uuid,
    pub status: crate::evolve::TaskStatus,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub tool_available: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Wrapper mapping core errors onto HTTP statuses.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::SessionNotFound(_) | CoreError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::CapabilityViolation(_) => StatusCode::FORBIDDEN,
            CoreError::SessionBusy(_)
            | CoreError::ConcurrentTargetConflict(_)
            | CoreError::TaskActive(_) => StatusCode::CONFLICT,
            CoreError::InvocationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::InvocationRejected { .. } => StatusCode::BAD_GATEWAY,
            CoreError::ToolUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::VerificationCommandCrash(_) | CoreError::IterationLimitExceeded(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// 422 for request payloads that fail semantic validation.
pub fn unprocessable(message: impl Into<String>) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let response = ApiError(CoreError::SessionNotFound(Uuid::new_v4())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response =
            ApiError(CoreError::ConcurrentTargetConflict(PathBuf::from("/x"))).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = ApiError(CoreError::InvocationTimeout {
            tier: "sonnet".to_string(),
            timeout_secs: 300,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_evolve_request_defaults() {
        let request: EvolveRequest = serde_json::from_str(
            r#"{"target_path":"/tmp/lib.rs","objective":"speed","verify_command":"true"}"#,
        )
        .unwrap();
        assert_eq!(request.max_iterations, 5);
        assert_eq!(request.context_mode, IterationContext::FailureSummary);
        assert!(request.capabilities.is_none());
    }
}
