// Gateway request/response types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// A named file-system or execution capability the external tool may exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Search,
    Edit,
    Write,
    Execute,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Read => "Read",
            Capability::Search => "Search",
            Capability::Edit => "Edit",
            Capability::Write => "Write",
            Capability::Execute => "Execute",
        }
    }

    /// Whether exercising this capability can change the working tree.
    pub fn mutates_files(&self) -> bool {
        matches!(
            self,
            Capability::Edit | Capability::Write | Capability::Execute
        )
    }
}

/// Token counters reported by the tool for one invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One raw call into the tool backend, fully resolved (no session indirection).
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub prompt: String,
    /// The tool's own conversation id, used to resume prior context.
    pub native_session_id: Option<String>,
    pub tier: String,
    pub capabilities: Vec<Capability>,
    pub working_dir: PathBuf,
}

/// What the tool backend returns on success.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub native_session_id: Option<String>,
    pub usage: TokenUsage,
}

/// Typed failures from the tool backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolFailure {
    #[error("tool unavailable: {0}")]
    Unavailable(String),

    #[error("tool rejected the request: {0}")]
    Rejected(String),
}

/// A logical invocation as the engine and chat handlers issue it.
///
/// The gateway resolves session-bound details (working directory, native
/// session id, no-widening of the permitted capability set) and enforces the
/// timeout plus the single fallback-tier retry.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    pub session_id: Option<Uuid>,
    pub primary_tier: String,
    pub fallback_tier: Option<String>,
    /// Capabilities granted to the tool for this invocation.
    pub capabilities: Vec<Capability>,
    /// Capabilities the calling context needs. Must be covered by
    /// `capabilities`; an empty grant with a mutating requirement fails closed.
    pub required: Vec<Capability>,
    /// Working directory for a sessionless invocation. Ignored when a session
    /// is bound (the session's fixed directory wins).
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

/// The accepted response of one logical invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    pub content: String,
    /// Tier that actually produced the response (fallback may differ from
    /// the session's or request's primary tier).
    pub tier_used: String,
    pub usage: TokenUsage,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_mutation_classes() {
        assert!(!Capability::Read.mutates_files());
        assert!(!Capability::Search.mutates_files());
        assert!(Capability::Edit.mutates_files());
        assert!(Capability::Write.mutates_files());
        assert!(Capability::Execute.mutates_files());
    }

    #[test]
    fn test_capability_serde_lowercase() {
        let json = serde_json::to_string(&Capability::Edit).unwrap();
        assert_eq!(json, "\"edit\"");
        let cap: Capability = serde_json::from_str("\"execute\"").unwrap();
        assert_eq!(cap, Capability::Execute);
    }

    #[test]
    fn test_usage_accumulate() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        });
        total.accumulate(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.total_tokens, 18);
        assert_eq!(total.input_tokens, 11);
    }
}
