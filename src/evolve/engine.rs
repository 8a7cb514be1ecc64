// Evolution Engine - drives N propose/apply/verify iterations over one artifact
//
// Iterations within a task are strictly sequential. The artifact is left in
// its modified state between iterations so each attempt builds on the last;
// only a terminal Failed or Cancelled outcome rolls back to the pre-task
// snapshot, so a broken artifact is never the final state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::apply;
use super::types::{
    Decision, EvolutionTask, EvolveSpec, IterationContext, IterationRecord, StatusProjection,
    TaskStatus,
};
use super::verify::{self, VerifyOutcome};
use crate::error::CoreError;
use crate::gateway::{Capability, Gateway, InvocationRequest};
use crate::session::SessionStore;

/// Verification failure text carried into the next iteration's instruction.
const FAILURE_SUMMARY_CAP: usize = 2_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub invoke_timeout: Duration,
    pub verify_timeout: Duration,
    pub default_tier: String,
    pub fallback_tier: Option<String>,
    pub default_capabilities: Vec<Capability>,
}

/// How one run ended, before finalization maps it onto task status.
enum Outcome {
    Succeeded,
    Exhausted,
    Cancelled,
    Error(String),
}

pub struct EvolutionEngine {
    gateway: Arc<Gateway>,
    sessions: Arc<SessionStore>,
    config: EngineConfig,
}

impl EvolutionEngine {
    pub fn new(gateway: Arc<Gateway>, sessions: Arc<SessionStore>, config: EngineConfig) -> Self {
        Self {
            gateway,
            sessions,
            config,
        }
    }

    /// Run one task to a terminal state. The registry owns scheduling and
    /// target-path exclusivity; this only mutates the task it was handed.
    pub async fn run(
        &self,
        task: Arc<RwLock<EvolutionTask>>,
        projection: Arc<RwLock<StatusProjection>>,
        cancel: CancellationToken,
    ) {
        let (task_id, spec) = {
            let t = task.read().await;
            (t.id, t.spec.clone())
        };

        // Pre-task snapshot: the rollback point for every non-success outcome.
        let baseline = match tokio::fs::read_to_string(&spec.target_path).await {
            Ok(content) => content,
            Err(e) => {
                let error = format!(
                    "target artifact {} unreadable: {}",
                    spec.target_path.display(),
                    e
                );
                tracing::error!(task_id = %task_id, %error, "evolution task failed to start");
                Self::finalize(&task, &projection, TaskStatus::Failed, Some(error)).await;
                return;
            }
        };

        {
            let mut t = task.write().await;
            t.status = TaskStatus::Running;
        }
        Self::commit(&task, &projection).await;
        tracing::info!(
            task_id = %task_id,
            target = %spec.target_path.display(),
            max_iterations = spec.max_iterations,
            "evolution task running"
        );

        let tier = self.resolve_tier(&spec);
        let fallback = self.resolve_fallback(&spec);
        let capabilities = self.resolve_capabilities(&spec);
        let working_dir = self.resolve_working_dir(&spec);

        let mut last_failure: Option<String> = None;

        let outcome = loop {
            // Cooperative cancellation, observed at iteration boundaries only.
            if cancel.is_cancelled() {
                break Outcome::Cancelled;
            }

            let completed = task.read().await.current_iteration;
            if completed >= spec.max_iterations {
                break Outcome::Exhausted;
            }
            let iteration = completed + 1;

            let snapshot = match tokio::fs::read_to_string(&spec.target_path).await {
                Ok(content) => content,
                Err(e) => break Outcome::Error(format!("target artifact vanished: {}", e)),
            };

            let prior_outputs = match spec.context_mode {
                IterationContext::FailureSummary => Vec::new(),
                IterationContext::FullHistory => {
                    let t = task.read().await;
                    t.records
                        .iter()
                        .map(|r| (r.iteration, r.output.clone()))
                        .collect()
                }
            };
            let prompt =
                build_instruction(&spec, iteration, last_failure.as_deref(), &prior_outputs);

            let request = InvocationRequest {
                prompt,
                session_id: spec.session_id,
                primary_tier: tier.clone(),
                fallback_tier: fallback.clone(),
                capabilities: capabilities.clone(),
                required: vec![Capability::Edit],
                working_dir: working_dir.clone(),
                timeout: self.config.invoke_timeout,
            };

            tracing::info!(task_id = %task_id, iteration, max = spec.max_iterations, "evolution iteration");

            let proposal = match self.gateway.invoke(request).await {
                Ok(result) => result,
                Err(e) => {
                    // Unrecoverable tool failure, not a verification failure.
                    let error = e.to_string();
                    Self::record(
                        &task,
                        &projection,
                        IterationRecord {
                            iteration,
                            snapshot,
                            proposed: String::new(),
                            exit_code: None,
                            output: error.clone(),
                            decision: Decision::StopError,
                            timestamp: chrono::Utc::now(),
                        },
                    )
                    .await;
                    break Outcome::Error(error);
                }
            };

            let at_limit = iteration >= spec.max_iterations;

            match apply::apply_proposal(&spec.target_path, &proposal.content).await {
                Ok(applied) => {
                    let verified = verify::run_verification(
                        &spec.verify_command,
                        &working_dir,
                        self.config.verify_timeout,
                    )
                    .await;

                    match verified {
                        Ok(outcome) if outcome.passed() => {
                            Self::record(
                                &task,
                                &projection,
                                IterationRecord {
                                    iteration,
                                    snapshot,
                                    proposed: applied,
                                    exit_code: outcome.exit_code,
                                    output: outcome.output,
                                    decision: Decision::StopSuccess,
                                    timestamp: chrono::Utc::now(),
                                },
                            )
                            .await;
                            break Outcome::Succeeded;
                        }
                        Ok(outcome) => {
                            last_failure = Some(failure_summary(&outcome));
                            Self::record(
                                &task,
                                &projection,
                                IterationRecord {
                                    iteration,
                                    snapshot,
                                    proposed: applied,
                                    exit_code: outcome.exit_code,
                                    output: outcome.output,
                                    decision: if at_limit {
                                        Decision::StopExhausted
                                    } else {
                                        Decision::Continue
                                    },
                                    timestamp: chrono::Utc::now(),
                                },
                            )
                            .await;
                            if at_limit {
                                break Outcome::Exhausted;
                            }
                        }
                        Err(crash) => {
                            let error = crash.to_string();
                            Self::record(
                                &task,
                                &projection,
                                IterationRecord {
                                    iteration,
                                    snapshot,
                                    proposed: applied,
                                    exit_code: None,
                                    output: error.clone(),
                                    decision: Decision::StopError,
                                    timestamp: chrono::Utc::now(),
                                },
                            )
                            .await;
                            break Outcome::Error(error);
                        }
                    }
                }
                // A malformed proposal is a failed iteration, not a tool failure.
                Err(apply_err) => {
                    last_failure = Some(format!(
                        "the proposed change could not be applied: {}",
                        apply_err
                    ));
                    Self::record(
                        &task,
                        &projection,
                        IterationRecord {
                            iteration,
                            snapshot,
                            proposed: proposal.content,
                            exit_code: None,
                            output: apply_err,
                            decision: if at_limit {
                                Decision::StopExhausted
                            } else {
                                Decision::Continue
                            },
                            timestamp: chrono::Utc::now(),
                        },
                    )
                    .await;
                    if at_limit {
                        break Outcome::Exhausted;
                    }
                }
            }
        };

        let (status, mut last_error, needs_rollback) = match outcome {
            Outcome::Succeeded => (TaskStatus::Succeeded, None, false),
            Outcome::Exhausted => (
                TaskStatus::Failed,
                Some(CoreError::IterationLimitExceeded(spec.max_iterations).to_string()),
                true,
            ),
            Outcome::Cancelled => (TaskStatus::Cancelled, None, true),
            Outcome::Error(e) => (TaskStatus::Failed, Some(e), true),
        };

        if needs_rollback {
            if let Err(e) = tokio::fs::write(&spec.target_path, &baseline).await {
                let note = format!("rollback to pre-task snapshot failed: {}", e);
                tracing::error!(task_id = %task_id, %note);
                last_error = Some(match last_error {
                    Some(prev) => format!("{}; {}", prev, note),
                    None => note,
                });
            } else {
                tracing::info!(task_id = %task_id, "artifact rolled back to pre-task snapshot");
            }
        }

        tracing::info!(task_id = %task_id, status = ?status, "evolution task finished");
        Self::finalize(&task, &projection, status, last_error).await;
    }

    fn resolve_tier(&self, spec: &EvolveSpec) -> String {
        if let Some(tier) = &spec.tier {
            return tier.clone();
        }
        spec.session_id
            .and_then(|id| self.sessions.get(id))
            .map(|s| s.primary_tier)
            .unwrap_or_else(|| self.config.default_tier.clone())
    }

    /// Explicit grant, else the bound session's fixed set, else the
    /// configured default. Never wider than what the session permits.
    fn resolve_capabilities(&self, spec: &EvolveSpec) -> Vec<Capability> {
        if let Some(capabilities) = &spec.capabilities {
            return capabilities.clone();
        }
        spec.session_id
            .and_then(|id| self.sessions.get(id))
            .map(|s| s.capabilities)
            .unwrap_or_else(|| self.config.default_capabilities.clone())
    }

    fn resolve_fallback(&self, spec: &EvolveSpec) -> Option<String> {
        spec.session_id
            .and_then(|id| self.sessions.get(id))
            .and_then(|s| s.fallback_tier)
            .or_else(|| self.config.fallback_tier.clone())
    }

    /// Session directory when bound, else the target's parent directory.
    fn resolve_working_dir(&self, spec: &EvolveSpec) -> std::path::PathBuf {
        if let Some(session) = spec.session_id.and_then(|id| self.sessions.get(id)) {
            return session.working_dir;
        }
        spec.target_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    }

    /// Commit one finished iteration: task state first, then the projection,
    /// so pollers never observe an iteration count ahead of the records.
    async fn record(
        task: &Arc<RwLock<EvolutionTask>>,
        projection: &Arc<RwLock<StatusProjection>>,
        record: IterationRecord,
    ) {
        {
            let mut t = task.write().await;
            t.current_iteration = record.iteration;
            t.records.push(record);
        }
        Self::commit(task, projection).await;
    }

    async fn finalize(
        task: &Arc<RwLock<EvolutionTask>>,
        projection: &Arc<RwLock<StatusProjection>>,
        status: TaskStatus,
        last_error: Option<String>,
    ) {
        {
            let mut t = task.write().await;
            t.status = status;
            t.last_error = last_error;
            t.completed_at = Some(chrono::Utc::now());
        }
        Self::commit(task, projection).await;
    }

    async fn commit(
        task: &Arc<RwLock<EvolutionTask>>,
        projection: &Arc<RwLock<StatusProjection>>,
    ) {
        let snapshot = {
            let t = task.read().await;
            StatusProjection {
                status: t.status,
                current_iteration: t.current_iteration,
                max_iterations: t.spec.max_iterations,
                last_error: t.last_error.clone(),
            }
        };
        *projection.write().await = snapshot;
    }
}

/// Instruction for one iteration: the fixed objective, plus (after the first
/// iteration) the previous failure summary or the full prior history.
fn build_instruction(
    spec: &EvolveSpec,
    iteration: u32,
    last_failure: Option<&str>,
    prior_outputs: &[(u32, String)],
) -> String {
    let mut prompt = format!(
        "Revise the file at '{}'.\n\nObjective: {}\n\nReply with the complete updated content \
         of the file in a single fenced code block.",
        spec.target_path.display(),
        spec.objective
    );

    if iteration > 1 {
        match spec.context_mode {
            IterationContext::FailureSummary => {
                if let Some(summary) = last_failure {
                    prompt.push_str(&format!(
                        "\n\nThe previous attempt failed verification:\n{}\n\nAddress the failure and try again.",
                        summary
                    ));
                }
            }
            IterationContext::FullHistory => {
                for (number, output) in prior_outputs {
                    prompt.push_str(&format!(
                        "\n\nIteration {} verification output:\n{}",
                        number,
                        truncate(output, FAILURE_SUMMARY_CAP)
                    ));
                }
            }
        }
    }

    prompt
}

fn failure_summary(outcome: &VerifyOutcome) -> String {
    let header = match outcome.exit_code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (deadline exceeded)".to_string(),
    };
    format!("{}\n{}", header, truncate(&outcome.output, FAILURE_SUMMARY_CAP))
}

fn truncate(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    format!("{}...", &text[..verify::floor_char_boundary(text, cap)])
}
