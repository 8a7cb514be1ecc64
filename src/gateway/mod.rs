// Invocation Gateway - owns a single logical call into the external tool
//
// One logical invocation is at most two attempts: the primary tier, then
// exactly one retry on the fallback tier (if configured and distinct) with a
// fresh timeout budget. Session-bound invocations append exactly one message
// on success; a failed primary attempt before a successful fallback leaves no
// trace in the history.

mod backend;
mod types;

pub use backend::{CliBackend, ScriptedBackend, ScriptedStep, ToolBackend};
pub use types::{
    Capability, InvocationRequest, InvocationResult, TokenUsage, ToolFailure, ToolOutput,
    ToolRequest,
};

use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;

use crate::error::CoreError;
use crate::session::{Message, Role, SessionStore};

pub struct Gateway {
    backend: Arc<dyn ToolBackend>,
    sessions: Arc<SessionStore>,
}

impl Gateway {
    pub fn new(backend: Arc<dyn ToolBackend>, sessions: Arc<SessionStore>) -> Self {
        Self { backend, sessions }
    }

    /// Whether the underlying tool is installed and responding.
    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    /// Issue one logical invocation.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<InvocationResult, CoreError> {
        self.check_capabilities(&request)?;

        // Resolve session-bound context. The session's fixed working
        // directory always wins over the request's.
        let (working_dir, native_session_id) = match request.session_id {
            Some(id) => {
                let session = self
                    .sessions
                    .get(id)
                    .ok_or(CoreError::SessionNotFound(id))?;
                self.sessions.check_no_widening(id, &request.capabilities)?;
                (session.working_dir.clone(), session.native_id.clone())
            }
            None => (request.working_dir.clone(), None),
        };

        let started = Instant::now();

        let primary = ToolRequest {
            prompt: request.prompt.clone(),
            native_session_id,
            tier: request.primary_tier.clone(),
            capabilities: request.capabilities.clone(),
            working_dir,
        };

        let first = self.attempt(&primary, &request).await;

        let (output, tier_used) = match first {
            Ok(output) => (output, request.primary_tier.clone()),
            Err(primary_err) => {
                let fallback = request
                    .fallback_tier
                    .as_ref()
                    .filter(|tier| **tier != request.primary_tier);

                match fallback {
                    Some(tier) => {
                        tracing::warn!(
                            primary = %request.primary_tier,
                            fallback = %tier,
                            error = %primary_err,
                            "primary tier failed, retrying once on fallback"
                        );
                        let retry = ToolRequest {
                            tier: tier.clone(),
                            ..primary
                        };
                        // Second failure is final: no further retries.
                        let output = self.attempt(&retry, &request).await?;
                        (output, tier.clone())
                    }
                    None => return Err(primary_err),
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = InvocationResult {
            content: output.content,
            tier_used,
            usage: output.usage,
            duration_ms,
        };

        if let Some(session_id) = request.session_id {
            if let Some(native_id) = output.native_session_id {
                self.sessions.record_native_id(session_id, native_id);
            }
            self.sessions.append(
                session_id,
                Message::new(Role::Assistant, &result.content, &result.tier_used)
                    .with_usage(result.usage)
                    .with_duration(duration_ms),
            )?;
        }

        tracing::info!(
            tier = %result.tier_used,
            duration_ms,
            total_tokens = result.usage.total_tokens,
            "invocation complete"
        );

        Ok(result)
    }

    /// One attempt on one tier, bounded by the request timeout. A dropped
    /// backend future must terminate its child process (kill_on_drop).
    async fn attempt(
        &self,
        tool_request: &ToolRequest,
        request: &InvocationRequest,
    ) -> Result<ToolOutput, CoreError> {
        match timeout(request.timeout, self.backend.run(tool_request)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(ToolFailure::Rejected(diagnostic))) => {
                Err(CoreError::InvocationRejected { diagnostic })
            }
            Ok(Err(ToolFailure::Unavailable(reason))) => Err(CoreError::ToolUnavailable(reason)),
            Err(_) => Err(CoreError::InvocationTimeout {
                tier: tool_request.tier.clone(),
                timeout_secs: request.timeout.as_secs(),
            }),
        }
    }

    /// Fail closed: every capability the context needs must be granted
    /// explicitly. An empty grant never widens into file mutation.
    fn check_capabilities(&self, request: &InvocationRequest) -> Result<(), CoreError> {
        for needed in &request.required {
            if !request.capabilities.contains(needed) {
                let detail = if request.capabilities.is_empty() && needed.mutates_files() {
                    format!(
                        "context requires '{}' but no capabilities were granted",
                        needed.as_str()
                    )
                } else {
                    format!("context requires '{}' which was not granted", needed.as_str())
                };
                return Err(CoreError::CapabilityViolation(detail));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::new())
    }

    fn request(session_id: Option<uuid::Uuid>) -> InvocationRequest {
        InvocationRequest {
            prompt: "improve this".to_string(),
            session_id,
            primary_tier: "sonnet".to_string(),
            fallback_tier: Some("haiku".to_string()),
            capabilities: vec![Capability::Read, Capability::Edit],
            required: vec![Capability::Edit],
            working_dir: PathBuf::from("."),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_timeout_falls_back_once() {
        let sessions = store();
        let session = sessions.create(
            Some("test".to_string()),
            PathBuf::from("."),
            vec![Capability::Read, Capability::Edit],
            "sonnet".to_string(),
            Some("haiku".to_string()),
        );

        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptedStep::Hang,
            ScriptedBackend::reply("fallback response"),
        ]));
        let gateway = Gateway::new(backend.clone(), sessions.clone());

        let result = gateway.invoke(request(Some(session.id))).await.unwrap();
        assert_eq!(result.content, "fallback response");
        assert_eq!(result.tier_used, "haiku");

        // Exactly one fallback attempt, exactly one appended message.
        assert_eq!(backend.calls(), 2);
        let history = sessions.history(session.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Assistant);
        assert_eq!(history[0].tier, "haiku");
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_tiers_timing_out_is_a_timeout_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptedStep::Hang,
            ScriptedStep::Hang,
        ]));
        let gateway = Gateway::new(backend.clone(), store());

        let err = gateway.invoke(request(None)).await.unwrap_err();
        assert!(matches!(err, CoreError::InvocationTimeout { .. }));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_retry_when_fallback_equals_primary() {
        let backend = Arc::new(ScriptedBackend::new(vec![ScriptedStep::Fail(
            ToolFailure::Rejected("tier offline".to_string()),
        )]));
        let gateway = Gateway::new(backend.clone(), store());

        let mut req = request(None);
        req.fallback_tier = Some("sonnet".to_string());
        let err = gateway.invoke(req).await.unwrap_err();
        assert!(matches!(err, CoreError::InvocationRejected { .. }));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejection_carries_diagnostic_after_fallback() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptedStep::Fail(ToolFailure::Rejected("primary said no".to_string())),
            ScriptedStep::Fail(ToolFailure::Rejected("fallback said no".to_string())),
        ]));
        let gateway = Gateway::new(backend.clone(), store());

        let err = gateway.invoke(request(None)).await.unwrap_err();
        match err {
            CoreError::InvocationRejected { diagnostic } => {
                assert_eq!(diagnostic, "fallback said no")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_grant_with_mutation_fails_closed() {
        let backend = Arc::new(ScriptedBackend::new(vec![ScriptedBackend::reply("nope")]));
        let gateway = Gateway::new(backend.clone(), store());

        let mut req = request(None);
        req.capabilities = vec![];
        let err = gateway.invoke(req).await.unwrap_err();
        assert!(matches!(err, CoreError::CapabilityViolation(_)));
        // Rejected before any attempt reaches the tool.
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_session_capability_widening_rejected() {
        let sessions = store();
        let session = sessions.create(
            None,
            PathBuf::from("."),
            vec![Capability::Read],
            "sonnet".to_string(),
            None,
        );
        let backend = Arc::new(ScriptedBackend::new(vec![ScriptedBackend::reply("hi")]));
        let gateway = Gateway::new(backend.clone(), sessions);

        // Session grants Read only; asking for Edit would widen it.
        let mut req = request(Some(session.id));
        req.required = vec![];
        let err = gateway.invoke(req).await.unwrap_err();
        assert!(matches!(err, CoreError::CapabilityViolation(_)));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let gateway = Gateway::new(
            Arc::new(ScriptedBackend::new(vec![])),
            store(),
        );
        let err = gateway.invoke(request(Some(uuid::Uuid::new_v4()))).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_invocation_appends_nothing() {
        let sessions = store();
        let session = sessions.create(
            None,
            PathBuf::from("."),
            vec![Capability::Read, Capability::Edit],
            "sonnet".to_string(),
            None,
        );
        let backend = Arc::new(ScriptedBackend::new(vec![ScriptedStep::Fail(
            ToolFailure::Rejected("no".to_string()),
        )]));
        let gateway = Gateway::new(backend, sessions.clone());

        let mut req = request(Some(session.id));
        req.fallback_tier = None;
        assert!(gateway.invoke(req).await.is_err());
        assert!(sessions.history(session.id).unwrap().is_empty());
    }
}
