// Evolution task data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::gateway::Capability;

/// Task lifecycle. Transitions are monotonic: no task leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Decision the engine took at the end of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Continue,
    StopSuccess,
    StopExhausted,
    StopError,
}

/// How much prior context each iteration's instruction carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationContext {
    /// Only the latest verification failure summary. Bounds context growth.
    #[default]
    FailureSummary,
    /// Every prior iteration's verification output.
    FullHistory,
}

/// Submission parameters for one evolution run.
#[derive(Debug, Clone)]
pub struct EvolveSpec {
    pub target_path: PathBuf,
    pub objective: String,
    pub verify_command: String,
    pub max_iterations: u32,
    pub session_id: Option<Uuid>,
    /// Capabilities granted to the tool. `None` uses the engine default.
    pub capabilities: Option<Vec<Capability>>,
    /// Tier override. `None` uses the bound session's tier or the engine
    /// default.
    pub tier: Option<String>,
    pub context_mode: IterationContext,
}

/// Immutable record of one completed iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    /// 1-based iteration number.
    pub iteration: u32,
    /// Artifact content before this iteration's change was applied.
    pub snapshot: String,
    /// Content the tool proposed (as applied, or raw when apply failed).
    pub proposed: String,
    /// Verification exit code; `None` when the command never produced one
    /// (apply failure, deadline exceeded).
    pub exit_code: Option<i32>,
    /// Captured verification output, truncated for storage.
    pub output: String,
    pub decision: Decision,
    pub timestamp: DateTime<Utc>,
}

/// The engine-owned task state. The registry keeps only a projection of it.
#[derive(Debug)]
pub struct EvolutionTask {
    pub id: Uuid,
    pub spec: EvolveSpec,
    pub status: TaskStatus,
    pub current_iteration: u32,
    pub records: Vec<IterationRecord>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvolutionTask {
    pub fn new(id: Uuid, spec: EvolveSpec) -> Self {
        Self {
            id,
            spec,
            status: TaskStatus::Pending,
            current_iteration: 0,
            records: Vec::new(),
            last_error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Non-blocking lifecycle view the registry serves to pollers. Committed by
/// the engine at iteration boundaries.
#[derive(Debug, Clone, Serialize)]
pub struct StatusProjection {
    pub status: TaskStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(
            serde_json::to_string(&Decision::StopExhausted).unwrap(),
            "\"stop_exhausted\""
        );
    }

    #[test]
    fn test_context_mode_default_is_failure_summary() {
        assert_eq!(IterationContext::default(), IterationContext::FailureSummary);
    }
}
