// End-to-end evolution scenarios against a scripted tool backend

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crucible::error::CoreError;
use crucible::evolve::{
    Decision, EngineConfig, EvolutionEngine, EvolveSpec, IterationContext, StatusProjection,
    TaskStatus,
};
use crucible::gateway::{Capability, Gateway, ScriptedBackend, TokenUsage, ToolOutput};
use crucible::registry::TaskRegistry;
use crucible::session::SessionStore;
use uuid::Uuid;

fn fenced(content: &str) -> String {
    format!("Here you go:\n```\n{}\n```", content)
}

fn reply(content: &str) -> crucible::gateway::ScriptedStep {
    ScriptedBackend::reply(content)
}

struct Harness {
    registry: Arc<TaskRegistry>,
    sessions: Arc<SessionStore>,
}

fn harness(backend: ScriptedBackend) -> Harness {
    let sessions = Arc::new(SessionStore::new());
    let gateway = Arc::new(Gateway::new(Arc::new(backend), Arc::clone(&sessions)));
    let engine = Arc::new(EvolutionEngine::new(
        gateway,
        Arc::clone(&sessions),
        EngineConfig {
            invoke_timeout: Duration::from_secs(10),
            verify_timeout: Duration::from_secs(10),
            default_tier: "sonnet".to_string(),
            fallback_tier: Some("haiku".to_string()),
            default_capabilities: vec![Capability::Read, Capability::Edit, Capability::Execute],
        },
    ));
    Harness {
        registry: Arc::new(TaskRegistry::new(engine, Arc::clone(&sessions))),
        sessions,
    }
}

fn spec(target: PathBuf, verify_command: &str, max_iterations: u32) -> EvolveSpec {
    EvolveSpec {
        target_path: target,
        objective: "improve the implementation".to_string(),
        verify_command: verify_command.to_string(),
        max_iterations,
        session_id: None,
        capabilities: None,
        tier: None,
        context_mode: IterationContext::FailureSummary,
    }
}

async fn wait_terminal(registry: &TaskRegistry, id: Uuid) -> StatusProjection {
    for _ in 0..500 {
        let projection = registry.status(id).await.unwrap();
        assert!(
            projection.current_iteration <= projection.max_iterations,
            "iteration count exceeded the maximum"
        );
        if projection.status.is_terminal() {
            return projection;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached a terminal state");
}

#[tokio::test]
async fn always_failing_verification_exhausts_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("lib.rs");
    std::fs::write(&target, "original contents\n").unwrap();

    let backend = ScriptedBackend::new(vec![
        reply(&fenced("attempt one")),
        reply(&fenced("attempt two")),
        reply(&fenced("attempt three")),
    ]);
    let h = harness(backend);

    let id = h
        .registry
        .submit(spec(target.clone(), "false", 3))
        .await
        .unwrap();
    let projection = wait_terminal(&h.registry, id).await;

    assert_eq!(projection.status, TaskStatus::Failed);
    assert_eq!(projection.current_iteration, 3);
    assert!(projection
        .last_error
        .as_deref()
        .unwrap()
        .contains("iteration limit"));

    let detail = h.registry.detail(id).await.unwrap();
    assert_eq!(detail.iterations.len(), 3);
    assert_eq!(detail.iterations[0].decision, Decision::Continue);
    assert_eq!(detail.iterations[1].decision, Decision::Continue);
    assert_eq!(detail.iterations[2].decision, Decision::StopExhausted);

    // Rollback invariant: byte-for-byte equal to the pre-task snapshot.
    assert_eq!(
        std::fs::read_to_string(&target).unwrap(),
        "original contents\n"
    );
}

#[tokio::test]
async fn success_on_second_iteration_keeps_the_change() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("lib.rs");
    std::fs::write(&target, "v0").unwrap();

    // Verification greps for a marker only the second proposal carries.
    let backend = ScriptedBackend::new(vec![
        reply(&fenced("v1 without marker")),
        reply(&fenced("v2 MARKER present")),
        reply(&fenced("v3 never requested")),
    ]);
    let h = harness(backend);

    let verify = format!("grep -q MARKER {}", target.display());
    let id = h.registry.submit(spec(target.clone(), &verify, 5)).await.unwrap();
    let projection = wait_terminal(&h.registry, id).await;

    assert_eq!(projection.status, TaskStatus::Succeeded);
    assert_eq!(projection.current_iteration, 2);
    assert!(projection.last_error.is_none());

    let detail = h.registry.detail(id).await.unwrap();
    assert_eq!(detail.iterations.len(), 2);
    assert_eq!(detail.iterations[1].decision, Decision::StopSuccess);

    // Final artifact is iteration 2's proposal, and verification still passes.
    assert_eq!(
        std::fs::read_to_string(&target).unwrap(),
        "v2 MARKER present"
    );
    let recheck = crucible::evolve::run_verification(
        &verify,
        dir.path(),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(recheck.passed());
}

#[tokio::test]
async fn cancellation_lands_at_the_next_iteration_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("lib.rs");
    std::fs::write(&target, "pristine").unwrap();

    let backend = ScriptedBackend::repeating(ToolOutput {
        content: fenced("mutated"),
        native_session_id: None,
        usage: TokenUsage::default(),
    });
    let h = harness(backend);

    // Each iteration takes ~200ms in verification and always fails.
    let id = h
        .registry
        .submit(spec(target.clone(), "sleep 0.2 && false", 50))
        .await
        .unwrap();

    // Let at least one iteration complete, then cancel mid-run.
    for _ in 0..300 {
        if h.registry.status(id).await.unwrap().current_iteration >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.registry.cancel(id).await.unwrap();

    let projection = wait_terminal(&h.registry, id).await;
    assert_eq!(projection.status, TaskStatus::Cancelled);
    assert!(projection.current_iteration >= 1);
    assert!(projection.current_iteration < 50);

    // A cancelled task leaves no partial, unverified edits behind.
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "pristine");
}

#[tokio::test]
async fn unrecoverable_tool_failure_fails_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("lib.rs");
    std::fs::write(&target, "before").unwrap();

    // First iteration applies and fails verification; second iteration's
    // invocation is rejected outright (script exhausted -> unavailable).
    let backend = ScriptedBackend::new(vec![reply(&fenced("after"))]);
    let h = harness(backend);

    let id = h
        .registry
        .submit(spec(target.clone(), "false", 5))
        .await
        .unwrap();
    let projection = wait_terminal(&h.registry, id).await;

    assert_eq!(projection.status, TaskStatus::Failed);
    assert!(projection
        .last_error
        .as_deref()
        .unwrap()
        .contains("unavailable"));

    let detail = h.registry.detail(id).await.unwrap();
    assert_eq!(detail.iterations.last().unwrap().decision, Decision::StopError);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "before");
}

#[tokio::test]
async fn unusable_proposal_counts_as_a_failed_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("lib.rs");
    std::fs::write(&target, "keep me").unwrap();

    // An empty response cannot be applied; the next iteration recovers.
    let backend = ScriptedBackend::new(vec![reply("   "), reply(&fenced("fixed"))]);
    let h = harness(backend);

    let id = h.registry.submit(spec(target.clone(), "true", 5)).await.unwrap();
    let projection = wait_terminal(&h.registry, id).await;

    assert_eq!(projection.status, TaskStatus::Succeeded);
    let detail = h.registry.detail(id).await.unwrap();
    assert_eq!(detail.iterations.len(), 2);
    assert_eq!(detail.iterations[0].decision, Decision::Continue);
    assert!(detail.iterations[0].output.contains("no usable content"));
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "fixed");
}

#[tokio::test]
async fn session_bound_task_appends_history_and_blocks_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("lib.rs");
    std::fs::write(&target, "v0").unwrap();

    let backend = ScriptedBackend::repeating(ToolOutput {
        content: fenced("v1"),
        native_session_id: Some("native-7".to_string()),
        usage: TokenUsage {
            input_tokens: 3,
            output_tokens: 4,
            total_tokens: 7,
        },
    });
    let h = harness(backend);

    let session = h.sessions.create(
        Some("evolve".to_string()),
        dir.path().to_path_buf(),
        vec![Capability::Read, Capability::Edit, Capability::Execute],
        "sonnet".to_string(),
        None,
    );

    let mut s = spec(target.clone(), "sleep 0.2", 3);
    s.session_id = Some(session.id);
    let id = h.registry.submit(s).await.unwrap();

    // While the task runs, the bound session cannot be deleted.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        h.sessions.delete(session.id),
        Err(CoreError::SessionBusy(_))
    ));

    let projection = wait_terminal(&h.registry, id).await;
    assert_eq!(projection.status, TaskStatus::Succeeded);

    // One assistant message per successful invocation, in order.
    let history = h.sessions.history(session.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, fenced("v1"));

    // Released shortly after the terminal state.
    for attempt in 0..100 {
        match h.sessions.delete(session.id) {
            Ok(()) => break,
            Err(CoreError::SessionBusy(_)) if attempt < 99 => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("session was never released: {e}"),
        }
    }
}

#[tokio::test]
async fn unreadable_target_fails_without_iterating() {
    let h = harness(ScriptedBackend::new(vec![]));
    let id = h
        .registry
        .submit(spec(PathBuf::from("/no/such/file-9218.rs"), "true", 3))
        .await
        .unwrap();
    let projection = wait_terminal(&h.registry, id).await;

    assert_eq!(projection.status, TaskStatus::Failed);
    assert_eq!(projection.current_iteration, 0);
    assert!(projection.last_error.as_deref().unwrap().contains("unreadable"));
    assert!(h.registry.detail(id).await.unwrap().iterations.is_empty());
}
