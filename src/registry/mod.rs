// Task Registry - lifecycle tracking for asynchronous evolution runs
//
// Each submitted task runs as an independent tokio task. The registry holds
// the status projection the engine commits at iteration boundaries plus a
// pointer to the engine-owned task state, never a copy of iteration content.
// One active task per target path: a second submission against the same path
// is rejected up front.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CoreError;
use crate::evolve::{
    Decision, EvolutionEngine, EvolutionTask, EvolveSpec, IterationRecord, StatusProjection,
    TaskStatus,
};
use crate::session::SessionStore;

struct TaskEntry {
    target: PathBuf,
    task: Arc<RwLock<EvolutionTask>>,
    projection: Arc<RwLock<StatusProjection>>,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
}

/// One row in the task list.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub target: PathBuf,
    pub status: TaskStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub created_at: DateTime<Utc>,
}

/// Full task view including per-iteration outcomes (snapshots omitted).
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub id: Uuid,
    pub target: PathBuf,
    pub objective: String,
    pub verify_command: String,
    pub status: TaskStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub last_error: Option<String>,
    pub iterations: Vec<IterationView>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationView {
    pub iteration: u32,
    pub exit_code: Option<i32>,
    pub output: String,
    pub decision: Decision,
    pub timestamp: DateTime<Utc>,
}

impl IterationView {
    fn from_record(record: &IterationRecord) -> Self {
        Self {
            iteration: record.iteration,
            exit_code: record.exit_code,
            output: record.output.clone(),
            decision: record.decision,
            timestamp: record.timestamp,
        }
    }
}

pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<Uuid, TaskEntry>>>,
    /// Normalized target path -> owning task, for the exclusivity guard.
    active_targets: Arc<RwLock<HashMap<PathBuf, Uuid>>>,
    engine: Arc<EvolutionEngine>,
    sessions: Arc<SessionStore>,
}

impl TaskRegistry {
    pub fn new(engine: Arc<EvolutionEngine>, sessions: Arc<SessionStore>) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            active_targets: Arc::new(RwLock::new(HashMap::new())),
            engine,
            sessions,
        }
    }

    /// Validate and schedule one evolution run. Returns immediately with the
    /// task id; rejections (unknown session, capability widening, busy
    /// target) happen synchronously and never start a task.
    pub async fn submit(&self, spec: EvolveSpec) -> Result<Uuid, CoreError> {
        // Resolve the effective capability set up front: an explicit grant,
        // else the bound session's fixed set. The engine needs to mutate the
        // artifact, so a set without edit access can never make progress;
        // reject it here instead of starting a task doomed to fail closed at
        // its first invocation.
        let effective = match spec.session_id {
            Some(session_id) => {
                let session = self
                    .sessions
                    .get(session_id)
                    .ok_or(CoreError::SessionNotFound(session_id))?;
                let effective = spec
                    .capabilities
                    .clone()
                    .unwrap_or_else(|| session.capabilities.clone());
                self.sessions.check_no_widening(session_id, &effective)?;
                Some(effective)
            }
            None => spec.capabilities.clone(),
        };
        if let Some(capabilities) = &effective {
            if !capabilities.contains(&crate::gateway::Capability::Edit) {
                return Err(CoreError::CapabilityViolation(
                    "evolution requires the 'Edit' capability".to_string(),
                ));
            }
        }

        let target = normalize_target(&spec.target_path);
        let id = Uuid::new_v4();

        {
            let mut targets = self.active_targets.write().await;
            if let Some(owner) = targets.get(&target) {
                tracing::warn!(target = %target.display(), owner = %owner, "rejected conflicting submission");
                return Err(CoreError::ConcurrentTargetConflict(target));
            }
            targets.insert(target.clone(), id);
        }

        if let Some(session_id) = spec.session_id {
            self.sessions.mark_busy(session_id, id);
        }

        let max_iterations = spec.max_iterations;
        let session_id = spec.session_id;
        let task = Arc::new(RwLock::new(EvolutionTask::new(id, spec)));
        let projection = Arc::new(RwLock::new(StatusProjection {
            status: TaskStatus::Pending,
            current_iteration: 0,
            max_iterations,
            last_error: None,
        }));
        let cancel = CancellationToken::new();

        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(
                id,
                TaskEntry {
                    target: target.clone(),
                    task: Arc::clone(&task),
                    projection: Arc::clone(&projection),
                    cancel: cancel.clone(),
                    created_at: Utc::now(),
                },
            );
        }

        let engine = Arc::clone(&self.engine);
        let sessions = Arc::clone(&self.sessions);
        let active_targets = Arc::clone(&self.active_targets);
        tokio::spawn(async move {
            engine.run(task, projection, cancel).await;

            // Exclusivity ends with the run; the entry itself stays pollable.
            active_targets.write().await.remove(&target);
            if let Some(session_id) = session_id {
                sessions.release(session_id);
            }
        });

        tracing::info!(task_id = %id, "evolution task submitted");
        Ok(id)
    }

    /// Latest committed projection. Never blocks on in-progress iteration
    /// work: the engine holds the projection lock only to swap in a snapshot.
    pub async fn status(&self, id: Uuid) -> Result<StatusProjection, CoreError> {
        let tasks = self.tasks.read().await;
        let entry = tasks.get(&id).ok_or(CoreError::TaskNotFound(id))?;
        let projection = entry.projection.read().await.clone();
        Ok(projection)
    }

    pub async fn detail(&self, id: Uuid) -> Result<TaskDetail, CoreError> {
        let entry_task = {
            let tasks = self.tasks.read().await;
            let entry = tasks.get(&id).ok_or(CoreError::TaskNotFound(id))?;
            (Arc::clone(&entry.task), entry.created_at)
        };
        let (task, created_at) = entry_task;
        let t = task.read().await;
        Ok(TaskDetail {
            id: t.id,
            target: t.spec.target_path.clone(),
            objective: t.spec.objective.clone(),
            verify_command: t.spec.verify_command.clone(),
            status: t.status,
            current_iteration: t.current_iteration,
            max_iterations: t.spec.max_iterations,
            last_error: t.last_error.clone(),
            iterations: t.records.iter().map(IterationView::from_record).collect(),
            created_at,
            completed_at: t.completed_at,
        })
    }

    pub async fn list(&self) -> Vec<TaskSummary> {
        let tasks = self.tasks.read().await;
        let mut summaries = Vec::with_capacity(tasks.len());
        for (id, entry) in tasks.iter() {
            let projection = entry.projection.read().await;
            summaries.push(TaskSummary {
                id: *id,
                target: entry.target.clone(),
                status: projection.status,
                current_iteration: projection.current_iteration,
                max_iterations: projection.max_iterations,
                created_at: entry.created_at,
            });
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Trip the cancellation token. The engine observes it at the next
    /// iteration boundary; in-flight tool or verification calls still finish
    /// under their own hard deadlines.
    pub async fn cancel(&self, id: Uuid) -> Result<(), CoreError> {
        let tasks = self.tasks.read().await;
        let entry = tasks.get(&id).ok_or(CoreError::TaskNotFound(id))?;
        entry.cancel.cancel();
        tracing::info!(task_id = %id, "cancellation requested");
        Ok(())
    }

    /// Explicit cleanup of a terminal task. Running tasks must be cancelled
    /// and reach a terminal state first.
    pub async fn remove(&self, id: Uuid) -> Result<(), CoreError> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks.get(&id).ok_or(CoreError::TaskNotFound(id))?;
        if !entry.projection.read().await.status.is_terminal() {
            return Err(CoreError::TaskActive(id));
        }
        tasks.remove(&id);
        Ok(())
    }
}

/// Canonicalize when possible so two spellings of one path conflict; a not
/// yet existing path participates as written.
fn normalize_target(path: &std::path::Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
