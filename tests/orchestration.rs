//! End-to-end runs against the public engine API, backed by local
//! process environments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::broadcast;
use weir_core::config::{AppConfig, EnvironmentConfig};
use weir_core::error::FailureKind;
use weir_core::event::EventBus;
use weir_core::traits::{AgentRegistry, RunStore};
use weir_core::types::{
    AgentSpec, ApprovalStatus, EngineEvent, EventTriggerOn, NodeRunStatus, RunId, RunStatus,
    TriggerKind, TriggerSpec,
};
use weir_engine::Engine;
use weir_env::{EnvironmentBackend, ProcessBackend};
use weir_invoker::ConfigAgentRegistry;
use weir_store::SqliteRunStore;
use weir_test_utils::{definition, gated_node, node, script_agent};

struct Harness {
    engine: Engine,
    store: Arc<dyn RunStore>,
    bus: Arc<EventBus>,
    #[allow(dead_code)]
    root: tempfile::TempDir,
}

fn harness_with(config: AppConfig, agents: Vec<AgentSpec>) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let agents: HashMap<String, AgentSpec> =
        agents.into_iter().map(|a| (a.name.clone(), a)).collect();
    let config = AppConfig {
        agents: agents.clone(),
        ..config
    };
    let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::in_memory().unwrap());
    let bus = Arc::new(EventBus::default());
    let backend: Arc<dyn EnvironmentBackend> = Arc::new(ProcessBackend::new(
        EnvironmentConfig::default(),
        root.path().join("envs"),
    ));
    let registry: Arc<dyn AgentRegistry> = Arc::new(ConfigAgentRegistry::new(agents));
    let engine = Engine::new(config, store.clone(), registry, backend, bus.clone());
    Harness {
        engine,
        store,
        bus,
        root,
    }
}

async fn wait_terminal(rx: &mut broadcast::Receiver<EngineEvent>, run_id: &RunId) -> EngineEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if event.run_id() == run_id && event.is_run_terminal() {
            return event;
        }
    }
}

#[tokio::test]
async fn test_diamond_merges_both_branch_outputs() {
    let h = harness_with(
        AppConfig::default(),
        vec![
            script_agent(
                "emit",
                r#"echo '{"val": 7}' > "$WEIR_OUTPUT""#,
                HashMap::new(),
            ),
            script_agent("echo", r#"cat "$WEIR_INPUT" > "$WEIR_OUTPUT""#, HashMap::new()),
        ],
    );
    let def = definition(
        "wf-diamond",
        vec![
            node("seed", "emit", json!({}), &[]),
            node("left", "echo", json!({"x": "{{seed.output.val}}"}), &["seed"]),
            node("right", "echo", json!({"y": "{{seed.output.val}}"}), &["seed"]),
            node(
                "merge",
                "echo",
                json!({"l": "{{left.output.input.x}}", "r": "{{right.output.input.y}}"}),
                &["left", "right"],
            ),
        ],
    );
    h.store.put_workflow(&def).await.unwrap();
    let mut rx = h.bus.subscribe();

    let run_id = h
        .engine
        .trigger_run(&def, json!({}), TriggerKind::Manual)
        .await
        .unwrap();
    let event = wait_terminal(&mut rx, &run_id).await;
    assert!(matches!(event, EngineEvent::RunSuccess { .. }));

    let view = h.engine.get_run(&run_id).await.unwrap();
    assert_eq!(view.run.status, RunStatus::Success);
    assert_eq!(view.node_runs.len(), 4);
    assert!(view
        .node_runs
        .iter()
        .all(|r| r.status == NodeRunStatus::Success));

    let by_id = |id: &str| view.node_runs.iter().find(|r| r.node_id == id).unwrap();
    let merge = by_id("merge");
    assert_eq!(merge.resolved_input, json!({"l": 7, "r": 7}));

    // The merge node may not run until both branches have finished.
    let merge_finished = merge.finished_at.unwrap();
    assert!(merge_finished >= by_id("left").finished_at.unwrap());
    assert!(merge_finished >= by_id("right").finished_at.unwrap());
}

#[tokio::test]
async fn test_timed_out_node_is_retried_then_fails_the_run() {
    let mut config = AppConfig::default();
    config.retry.max_retries = 1;
    config.retry.initial_backoff_ms = 50;
    config.retry.max_backoff_ms = 100;
    let mut sleepy = script_agent("sleepy", "sleep 5", HashMap::new());
    sleepy.timeout_secs = 1;
    let h = harness_with(config, vec![sleepy]);

    let def = definition("wf-slowpoke", vec![node("a", "sleepy", json!({}), &[])]);
    h.store.put_workflow(&def).await.unwrap();
    let mut rx = h.bus.subscribe();

    let run_id = h
        .engine
        .trigger_run(&def, json!({}), TriggerKind::Manual)
        .await
        .unwrap();
    let event = wait_terminal(&mut rx, &run_id).await;
    assert!(matches!(event, EngineEvent::RunFailed { .. }));

    let view = h.engine.get_run(&run_id).await.unwrap();
    assert_eq!(view.run.status, RunStatus::Failed);
    assert_eq!(view.node_runs.len(), 1);
    let a = &view.node_runs[0];
    assert_eq!(a.status, NodeRunStatus::Failed);
    assert_eq!(a.error_kind, Some(FailureKind::Timeout));
    // Initial attempt plus one retry before giving up.
    assert_eq!(a.attempt, 2);
    assert!(a.error.as_ref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_single_slot_runs_nodes_serially() {
    let mut config = AppConfig::default();
    config.engine.max_parallel_nodes = 1;
    let h = harness_with(
        config,
        vec![script_agent(
            "pause",
            r#"sleep 0.4; echo '{}' > "$WEIR_OUTPUT""#,
            HashMap::new(),
        )],
    );
    let def = definition(
        "wf-serial",
        vec![
            node("left", "pause", json!({}), &[]),
            node("right", "pause", json!({}), &[]),
        ],
    );
    h.store.put_workflow(&def).await.unwrap();
    let mut rx = h.bus.subscribe();

    let started = Instant::now();
    let run_id = h
        .engine
        .trigger_run(&def, json!({}), TriggerKind::Manual)
        .await
        .unwrap();
    let event = wait_terminal(&mut rx, &run_id).await;
    let elapsed = started.elapsed();

    assert!(matches!(event, EngineEvent::RunSuccess { .. }));
    assert!(elapsed >= Duration::from_millis(750), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_unattended_gate_rejects_and_fails_the_run() {
    let mut config = AppConfig::default();
    config.engine.approval_timeout_secs = 1;
    let h = harness_with(
        config,
        vec![script_agent(
            "emit",
            r#"echo '{"val": 7}' > "$WEIR_OUTPUT""#,
            HashMap::new(),
        )],
    );
    let def = definition(
        "wf-unattended",
        vec![gated_node("deploy", "emit", json!({}), &[])],
    );
    h.store.put_workflow(&def).await.unwrap();
    let mut rx = h.bus.subscribe();

    let run_id = h
        .engine
        .trigger_run(&def, json!({}), TriggerKind::Manual)
        .await
        .unwrap();
    let event = wait_terminal(&mut rx, &run_id).await;
    assert!(matches!(event, EngineEvent::RunFailed { .. }));

    let view = h.engine.get_run(&run_id).await.unwrap();
    assert_eq!(view.run.status, RunStatus::Failed);
    let deploy = &view.node_runs[0];
    assert_eq!(deploy.status, NodeRunStatus::Failed);
    assert_eq!(deploy.error_kind, Some(FailureKind::ApprovalRejected));

    assert_eq!(view.approvals.len(), 1);
    let gate = &view.approvals[0];
    assert_eq!(gate.status, ApprovalStatus::Rejected);
    assert_eq!(gate.decided_by.as_deref(), Some("system:timeout"));
    assert_eq!(gate.reason.as_deref(), Some("approval deadline elapsed"));
}

#[tokio::test]
async fn test_definition_round_trip_preserves_edges() {
    let root = tempfile::tempdir().unwrap();
    let store = SqliteRunStore::open(&root.path().join("weir.db")).unwrap();

    let mut def = definition(
        "wf-shape",
        vec![
            node("seed", "emit", json!({"k": "v"}), &[]),
            node("left", "echo", json!({}), &["seed"]),
            node("right", "echo", json!({}), &["seed"]),
            gated_node("merge", "echo", json!({}), &["left", "right"]),
        ],
    );
    def.trigger = TriggerSpec::Event {
        workflow: "wf-upstream".to_string(),
        on: EventTriggerOn::Any,
    };
    def.version = 3;
    store.put_workflow(&def).await.unwrap();

    let loaded = store.get_workflow("wf-shape").await.unwrap();
    assert_eq!(loaded.id, def.id);
    assert_eq!(loaded.project_id, def.project_id);
    assert_eq!(loaded.version, 3);
    assert_eq!(loaded.trigger, def.trigger);
    assert_eq!(loaded.nodes.len(), def.nodes.len());
    for (got, want) in loaded.nodes.iter().zip(def.nodes.iter()) {
        assert_eq!(got.id, want.id);
        assert_eq!(got.agent, want.agent);
        assert_eq!(got.input, want.input);
        assert_eq!(got.depends_on, want.depends_on);
        assert_eq!(got.approval_required, want.approval_required);
    }
}
