//! Run orchestration.
//!
//! `Engine` is the entry point for starting, retrying, cancelling and
//! inspecting runs. Each accepted run gets one driver task that walks the
//! DAG: dispatch every ready node, wait for whichever task settles first,
//! dispatch whatever that unlocks. The first terminal node failure tears
//! the rest of the run down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use weir_core::config::AppConfig;
use weir_core::error::{Result, WeirError};
use weir_core::event::EventBus;
use weir_core::traits::{AgentRegistry, RunStore};
use weir_core::types::{
    ApprovalDecision, ApprovalId, EngineEvent, NodeRunStatus, Run, RunId, RunStatus, RunView,
    TriggerKind, WorkflowDefinition, WorkflowNode, WorkflowStatus,
};
use weir_env::EnvironmentBackend;
use weir_invoker::{template, Invoker, NodeOutcome};

use crate::approval::ApprovalBroker;
use crate::dag;
use crate::state::{NodeSignal, RunMachine};

pub struct Engine {
    config: AppConfig,
    store: Arc<dyn RunStore>,
    backend: Arc<dyn EnvironmentBackend>,
    invoker: Arc<Invoker>,
    broker: Arc<ApprovalBroker>,
    bus: Arc<EventBus>,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn RunStore>,
        registry: Arc<dyn AgentRegistry>,
        backend: Arc<dyn EnvironmentBackend>,
        bus: Arc<EventBus>,
    ) -> Self {
        let invoker = Arc::new(Invoker::new(&config, backend.clone(), registry));
        let broker = Arc::new(ApprovalBroker::new(store.clone(), bus.clone()));
        Self {
            config,
            store,
            backend,
            invoker,
            broker,
            bus,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate `def` and start a run of it. Returns once the run is
    /// accepted; execution continues on its own driver task.
    pub async fn trigger_run(
        &self,
        def: &WorkflowDefinition,
        context: Value,
        trigger_kind: TriggerKind,
    ) -> Result<RunId> {
        self.start_run(def, context, trigger_kind, 0, None, HashMap::new())
            .await
    }

    /// Start a run caused by another run finishing. Refuses chains deeper
    /// than the configured cap so workflows cannot trigger each other
    /// forever.
    pub async fn trigger_chained(
        &self,
        def: &WorkflowDefinition,
        context: Value,
        parent: &Run,
    ) -> Result<RunId> {
        let depth = parent.chain_depth + 1;
        if depth > self.config.engine.max_chain_depth {
            error!(
                workflow_id = %def.id,
                parent_run_id = %parent.id,
                chain_depth = depth,
                "Trigger chain too deep, refusing run"
            );
            return Err(WeirError::Validation(format!(
                "trigger chain depth {} exceeds the maximum {}",
                depth, self.config.engine.max_chain_depth
            )));
        }
        self.start_run(def, context, TriggerKind::Auto, depth, None, HashMap::new())
            .await
    }

    /// Resume a failed or cancelled run. Nodes that succeeded in the parent
    /// are not re-executed: their outputs seed the new run and they get no
    /// new node_runs rows.
    pub async fn retry_run(&self, run_id: &RunId) -> Result<RunId> {
        let parent = self.store.get_run(run_id).await?;
        match parent.status {
            RunStatus::Failed | RunStatus::Cancelled => {}
            other => {
                return Err(WeirError::Validation(format!(
                    "run '{}' is {}; only failed or cancelled runs can be retried",
                    run_id, other
                )))
            }
        }
        let def = self.store.get_workflow(&parent.workflow_id).await?;
        let prior = self.store.latest_node_runs(run_id).await?;
        let mut seeds = HashMap::new();
        for (node_id, node_run) in prior {
            if node_run.status != NodeRunStatus::Success {
                continue;
            }
            // The definition may have changed since the parent ran; a seed
            // for a removed node would never be read.
            if def.node(&node_id).is_none() {
                continue;
            }
            seeds.insert(node_id, node_run.output.unwrap_or(Value::Null));
        }
        info!(
            run_id = %run_id,
            workflow_id = %def.id,
            seeded = seeds.len(),
            "Retrying run"
        );
        self.start_run(
            &def,
            parent.context.clone(),
            TriggerKind::Retry,
            0,
            Some(parent.id.clone()),
            seeds,
        )
        .await
    }

    /// Request cooperative cancellation of a live run. A run that has
    /// already finished reports its terminal status; a non-terminal run
    /// with no live driver (stranded by an earlier shutdown) is settled
    /// directly.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        let token = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.get(&run_id.0).cloned()
        };
        if let Some(token) = token {
            info!(run_id = %run_id, "Cancelling run");
            token.cancel();
            return Ok(());
        }

        let mut run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(WeirError::Validation(format!(
                "run '{}' is already {}",
                run_id, run.status
            )));
        }
        warn!(run_id = %run_id, status = %run.status, "Cancelling stranded run");
        run.status = RunStatus::Cancelled;
        run.finished_at = Some(Utc::now());
        self.store.update_run(&run).await?;
        self.bus.publish(EngineEvent::RunCancelled {
            run_id: run.id.clone(),
            workflow_id: run.workflow_id.clone(),
        });
        Ok(())
    }

    /// Apply an operator's decision to a pending approval gate.
    pub async fn resume_approval(
        &self,
        approval_id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<()> {
        self.broker.respond(approval_id, decision).await
    }

    /// Everything an operator sees about one run.
    pub async fn get_run(&self, run_id: &RunId) -> Result<RunView> {
        let run = self.store.get_run(run_id).await?;
        let node_runs = self.store.node_runs(run_id).await?;
        let approvals = self.store.run_approvals(run_id).await?;
        Ok(RunView {
            run,
            node_runs,
            approvals,
        })
    }

    /// Remove execution environments left behind by runs that are no
    /// longer active, e.g. after a crash.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let live = self.store.active_run_ids().await?;
        let removed = self.backend.sweep_orphans(live).await?;
        if removed > 0 {
            warn!(removed, "Swept orphaned execution environments");
        }
        Ok(removed)
    }

    async fn start_run(
        &self,
        def: &WorkflowDefinition,
        context: Value,
        trigger_kind: TriggerKind,
        chain_depth: u32,
        parent_run_id: Option<RunId>,
        seeds: HashMap<String, Value>,
    ) -> Result<RunId> {
        dag::validate(def)?;
        if def.status == WorkflowStatus::Archived {
            return Err(WeirError::Validation(format!(
                "workflow '{}' is archived",
                def.id
            )));
        }

        let mut run = Run::new(def, trigger_kind, context);
        run.chain_depth = chain_depth;
        run.parent_run_id = parent_run_id;
        self.store.create_run(&run).await?;
        info!(
            run_id = %run.id,
            workflow_id = %def.id,
            trigger = %run.trigger_kind,
            "Run accepted"
        );

        let cancel = CancellationToken::new();
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.id.0.clone(), cancel.clone());

        let mut machine = RunMachine::new(
            self.store.clone(),
            self.bus.clone(),
            def.clone(),
            run.clone(),
            self.config.retry.max_retries,
        );
        machine.seed_completed(seeds);
        let driver = RunDriver {
            machine,
            invoker: self.invoker.clone(),
            broker: self.broker.clone(),
            max_parallel: self.config.engine.max_parallel_nodes,
            approval_timeout_secs: self.config.engine.approval_timeout_secs,
            cancel,
            gates: HashMap::new(),
        };
        let active = self.active.clone();
        let run_key = run.id.0.clone();
        tokio::spawn(async move {
            driver.drive().await;
            active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&run_key);
        });
        Ok(run.id)
    }
}

/// Result of one node task, reported through the driver's join set.
struct NodeCompletion {
    node_id: String,
    result: Result<NodeOutcome>,
}

enum Verdict {
    Success,
    Failed(String),
    Cancelled,
}

/// Owns one run from start to terminal status.
struct RunDriver {
    machine: RunMachine,
    invoker: Arc<Invoker>,
    broker: Arc<ApprovalBroker>,
    max_parallel: usize,
    approval_timeout_secs: u64,
    cancel: CancellationToken,
    /// Approval gates opened by this run, by node id. Discarded at teardown.
    gates: HashMap<String, ApprovalId>,
}

impl RunDriver {
    async fn drive(mut self) {
        let run_id = self.machine.run().id.clone();
        if let Err(e) = self.machine.begin().await {
            error!(run_id = %run_id, error = %e, "Run could not start");
            return;
        }
        let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
        let mut tasks: JoinSet<NodeCompletion> = JoinSet::new();

        let verdict = loop {
            if let Some((node_id, error)) = self.machine.failure().cloned() {
                self.teardown(&mut tasks).await;
                break Verdict::Failed(format!("node '{}' failed: {}", node_id, error));
            }
            if let Err(e) = self.dispatch_ready(&mut tasks, &sig_tx).await {
                error!(run_id = %run_id, error = %e, "Dispatch failed");
                self.teardown(&mut tasks).await;
                break Verdict::Failed(e.to_string());
            }
            // Template resolution failures surface here, before any wait.
            if let Some((node_id, error)) = self.machine.failure().cloned() {
                self.teardown(&mut tasks).await;
                break Verdict::Failed(format!("node '{}' failed: {}", node_id, error));
            }
            if tasks.is_empty() {
                if self.machine.all_succeeded() {
                    break Verdict::Success;
                }
                // A validated DAG always has a next ready node.
                error!(run_id = %run_id, "Scheduler stalled with pending nodes");
                break Verdict::Failed("scheduler stalled with pending nodes".to_string());
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.teardown(&mut tasks).await;
                    break Verdict::Cancelled;
                }
                Some(signal) = sig_rx.recv() => {
                    if let Err(e) = self.machine.apply_signal(signal).await {
                        warn!(run_id = %run_id, error = %e, "Progress update failed");
                    }
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(done) => {
                        if let Err(e) = self.machine.complete_node(&done.node_id, done.result).await {
                            error!(run_id = %run_id, error = %e, "Completion update failed");
                            self.teardown(&mut tasks).await;
                            break Verdict::Failed(e.to_string());
                        }
                    }
                    Err(join_error) => {
                        error!(run_id = %run_id, error = %join_error, "Node task aborted");
                        self.teardown(&mut tasks).await;
                        break Verdict::Failed(format!("node task aborted: {}", join_error));
                    }
                },
            }
        };

        let finished = match verdict {
            Verdict::Success => self.machine.finish_success().await,
            Verdict::Failed(error) => self.machine.finish_failed(error).await,
            Verdict::Cancelled => self.machine.finish_cancelled().await,
        };
        if let Err(e) = finished {
            error!(run_id = %run_id, error = %e, "Run finalization failed");
        }
    }

    /// Dispatch ready nodes until the executing count hits the cap or
    /// nothing is ready.
    async fn dispatch_ready(
        &mut self,
        tasks: &mut JoinSet<NodeCompletion>,
        sig_tx: &mpsc::UnboundedSender<NodeSignal>,
    ) -> Result<()> {
        loop {
            // Suspended gates hold a task slot but are not executing.
            let executing = tasks
                .len()
                .saturating_sub(self.machine.awaiting_approval_count());
            if executing >= self.max_parallel.max(1) {
                return Ok(());
            }
            let Some(node) = self.machine.ready().into_iter().next() else {
                return Ok(());
            };
            let resolved = match template::resolve(&node.input, self.machine.outputs()) {
                Ok(resolved) => resolved,
                Err(e) => {
                    self.machine.mark_failed_undispatched(&node.id, &e).await?;
                    return Ok(());
                }
            };
            if node.approval_required {
                self.dispatch_gated(node, resolved, tasks, sig_tx).await?;
            } else {
                self.dispatch_plain(node, resolved, tasks, sig_tx).await?;
            }
        }
    }

    async fn dispatch_plain(
        &mut self,
        node: WorkflowNode,
        resolved: Value,
        tasks: &mut JoinSet<NodeCompletion>,
        sig_tx: &mpsc::UnboundedSender<NodeSignal>,
    ) -> Result<()> {
        self.machine
            .mark_dispatched(&node.id, resolved.clone())
            .await?;
        let run = self.machine.run().clone();
        let invoker = self.invoker.clone();
        let cancel = self.cancel.clone();
        let sig = sig_tx.clone();
        tasks.spawn(async move {
            let _ = sig.send(NodeSignal::Started {
                node_id: node.id.clone(),
            });
            let result = invoker.invoke(&run, &node, &resolved, &cancel).await;
            NodeCompletion {
                node_id: node.id,
                result,
            }
        });
        Ok(())
    }

    async fn dispatch_gated(
        &mut self,
        node: WorkflowNode,
        resolved: Value,
        tasks: &mut JoinSet<NodeCompletion>,
        sig_tx: &mpsc::UnboundedSender<NodeSignal>,
    ) -> Result<()> {
        self.machine
            .mark_awaiting_approval(&node.id, resolved.clone())
            .await?;
        let run = self.machine.run().clone();
        let (approval, gate) = self
            .broker
            .request(&run.id, &node.id, self.approval_timeout_secs)
            .await?;
        self.gates.insert(node.id.clone(), approval.id.clone());

        let invoker = self.invoker.clone();
        let broker = self.broker.clone();
        let timeout_secs = self.approval_timeout_secs;
        let cancel = self.cancel.clone();
        let sig = sig_tx.clone();
        tasks.spawn(async move {
            let decision = broker
                .await_decision(&approval, gate, timeout_secs, &cancel)
                .await;
            let result = match decision {
                Ok(ApprovalDecision::Approved { .. }) => {
                    let _ = sig.send(NodeSignal::Approved {
                        node_id: node.id.clone(),
                    });
                    let _ = sig.send(NodeSignal::Started {
                        node_id: node.id.clone(),
                    });
                    invoker.invoke(&run, &node, &resolved, &cancel).await
                }
                Ok(ApprovalDecision::Rejected { reason, .. }) => {
                    Err(WeirError::ApprovalRejected {
                        reason: reason.unwrap_or_else(|| "rejected".to_string()),
                    })
                }
                Err(e) => Err(e),
            };
            NodeCompletion {
                node_id: node.id,
                result,
            }
        });
        Ok(())
    }

    /// Cancel outstanding work and settle every in-flight node before the
    /// run is finalized. Tasks that were already past the finish line still
    /// count; everything else lands as skipped.
    async fn teardown(&mut self, tasks: &mut JoinSet<NodeCompletion>) {
        self.cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => {
                    if let Err(e) = self
                        .machine
                        .complete_node(&done.node_id, done.result)
                        .await
                    {
                        warn!(error = %e, "Completion update during teardown failed");
                    }
                }
                Err(e) => warn!(error = %e, "Node task aborted during teardown"),
            }
        }
        for (node_id, approval_id) in std::mem::take(&mut self.gates) {
            if let Err(e) = self.broker.discard(&approval_id, "run torn down").await {
                warn!(node_id = %node_id, error = %e, "Approval discard failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast;
    use weir_core::config::EnvironmentConfig;
    use weir_core::types::{AgentKind, AgentSpec, RiskLevel, TriggerSpec};
    use weir_env::ProcessBackend;
    use weir_invoker::ConfigAgentRegistry;
    use weir_store::SqliteRunStore;

    struct Harness {
        engine: Engine,
        store: Arc<dyn RunStore>,
        bus: Arc<EventBus>,
        root: tempfile::TempDir,
    }

    fn script_agent(name: &str, script: &str, env: HashMap<String, String>) -> AgentSpec {
        AgentSpec {
            name: name.to_string(),
            kind: AgentKind::Script {
                image: "alpine:3.20".to_string(),
                command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                env,
                secrets: HashMap::new(),
            },
            risk: RiskLevel::Low,
            integration: None,
            timeout_secs: 20,
        }
    }

    fn harness() -> Harness {
        let root = tempfile::tempdir().unwrap();
        let flag = root.path().join("flag");
        let mut agents = HashMap::new();
        agents.insert(
            "emit".to_string(),
            script_agent("emit", r#"echo '{"val": 7}' > "$WEIR_OUTPUT""#, HashMap::new()),
        );
        agents.insert(
            "echo".to_string(),
            script_agent("echo", r#"cat "$WEIR_INPUT" > "$WEIR_OUTPUT""#, HashMap::new()),
        );
        agents.insert(
            "fail".to_string(),
            script_agent("fail", "exit 7", HashMap::new()),
        );
        agents.insert(
            "pause".to_string(),
            script_agent("pause", r#"sleep 0.5; echo '{}' > "$WEIR_OUTPUT""#, HashMap::new()),
        );
        agents.insert(
            "slow".to_string(),
            script_agent("slow", "sleep 30", HashMap::new()),
        );
        agents.insert(
            "flagged".to_string(),
            script_agent(
                "flagged",
                r#"test -f "$FLAG_FILE" || exit 7; echo '{"ok": true}' > "$WEIR_OUTPUT""#,
                HashMap::from([("FLAG_FILE".to_string(), flag.display().to_string())]),
            ),
        );

        let config = AppConfig {
            agents: agents.clone(),
            ..AppConfig::default()
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

    fn node(id: &str, agent: &str, input: Value, depends_on: &[&str]) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            agent: agent.to_string(),
            action: "run".to_string(),
            input,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            approval_required: false,
        }
    }

    fn definition(id: &str, nodes: Vec<WorkflowNode>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            project_id: "proj-1".to_string(),
            name: id.to_string(),
            version: 1,
            nodes,
            trigger: TriggerSpec::Manual,
            status: WorkflowStatus::Active,
        }
    }

    async fn recv_until<F>(rx: &mut broadcast::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn wait_terminal(
        rx: &mut broadcast::Receiver<EngineEvent>,
        run_id: &RunId,
    ) -> EngineEvent {
        recv_until(rx, |e| e.run_id() == run_id && e.is_run_terminal()).await
    }

    #[tokio::test]
    async fn test_linear_run_passes_outputs_downstream() {
        let h = harness();
        let def = definition(
            "wf-linear",
            vec![
                node("a", "emit", json!({}), &[]),
                node("b", "echo", json!({"tag": "{{a.output.val}}"}), &["a"]),
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
        assert!(view.run.started_at.is_some());
        assert!(view.run.finished_at.is_some());
        assert_eq!(view.node_runs.len(), 2);

        let b = view.node_runs.iter().find(|r| r.node_id == "b").unwrap();
        assert_eq!(b.status, NodeRunStatus::Success);
        // Whole-string placeholder keeps the source type.
        assert_eq!(b.resolved_input, json!({"tag": 7}));
        assert_eq!(b.output.as_ref().unwrap()["input"]["tag"], json!(7));
    }

    #[tokio::test]
    async fn test_cyclic_definition_creates_no_run() {
        let h = harness();
        let def = definition(
            "wf-cycle",
            vec![
                node("a", "emit", json!({}), &["b"]),
                node("b", "emit", json!({}), &["a"]),
            ],
        );

        let err = h
            .engine
            .trigger_run(&def, json!({}), TriggerKind::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, WeirError::Cycle { .. }));
        assert!(h.store.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archived_workflow_is_refused() {
        let h = harness();
        let mut def = definition("wf-archived", vec![node("a", "emit", json!({}), &[])]);
        def.status = WorkflowStatus::Archived;

        let err = h
            .engine
            .trigger_run(&def, json!({}), TriggerKind::Manual)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("archived"));
        assert!(h.store.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_node_failure_fails_run_and_skips_descendants() {
        let h = harness();
        let def = definition(
            "wf-fail",
            vec![
                node("a", "fail", json!({}), &[]),
                node("b", "emit", json!({}), &["a"]),
            ],
        );
        h.store.put_workflow(&def).await.unwrap();
        let mut rx = h.bus.subscribe();

        let run_id = h
            .engine
            .trigger_run(&def, json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        wait_terminal(&mut rx, &run_id).await;

        let view = h.engine.get_run(&run_id).await.unwrap();
        assert_eq!(view.run.status, RunStatus::Failed);
        assert!(view.run.error.as_ref().unwrap().contains("node 'a' failed"));
        let a = view.node_runs.iter().find(|r| r.node_id == "a").unwrap();
        assert_eq!(a.status, NodeRunStatus::Failed);
        assert_eq!(a.error_kind, Some(weir_core::error::FailureKind::Permanent));
        let b = view.node_runs.iter().find(|r| r.node_id == "b").unwrap();
        assert_eq!(b.status, NodeRunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_independent_nodes_run_in_parallel() {
        let h = harness();
        let def = definition(
            "wf-fanout",
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
        // Serial execution would take at least a second.
        assert!(elapsed < Duration::from_millis(950), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_approval_approved_resumes_run() {
        let h = harness();
        let mut gated = node("deploy", "emit", json!({}), &[]);
        gated.approval_required = true;
        let def = definition(
            "wf-gated",
            vec![gated, node("after", "echo", json!({}), &["deploy"])],
        );
        h.store.put_workflow(&def).await.unwrap();
        let mut rx = h.bus.subscribe();

        let run_id = h
            .engine
            .trigger_run(&def, json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        let event = recv_until(&mut rx, |e| {
            matches!(e, EngineEvent::ApprovalRequested { .. })
        })
        .await;
        let EngineEvent::ApprovalRequested { approval_id, .. } = event else {
            unreachable!()
        };

        // The gate parks the run before anyone decides.
        let parked = h.store.get_run(&run_id).await.unwrap();
        assert_eq!(parked.status, RunStatus::WaitingApproval);

        h.engine
            .resume_approval(
                &approval_id,
                ApprovalDecision::Approved {
                    decided_by: "alice".to_string(),
                },
            )
            .await
            .unwrap();
        let event = wait_terminal(&mut rx, &run_id).await;
        assert!(matches!(event, EngineEvent::RunSuccess { .. }));

        let view = h.engine.get_run(&run_id).await.unwrap();
        assert_eq!(view.approvals.len(), 1);
        assert_eq!(view.approvals[0].decided_by.as_deref(), Some("alice"));
        assert!(view
            .node_runs
            .iter()
            .all(|r| r.status == NodeRunStatus::Success));
    }

    #[tokio::test]
    async fn test_approval_rejected_fails_run() {
        let h = harness();
        let mut gated = node("deploy", "emit", json!({}), &[]);
        gated.approval_required = true;
        let def = definition(
            "wf-rejected",
            vec![gated, node("after", "emit", json!({}), &["deploy"])],
        );
        h.store.put_workflow(&def).await.unwrap();
        let mut rx = h.bus.subscribe();

        let run_id = h
            .engine
            .trigger_run(&def, json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        let event = recv_until(&mut rx, |e| {
            matches!(e, EngineEvent::ApprovalRequested { .. })
        })
        .await;
        let EngineEvent::ApprovalRequested { approval_id, .. } = event else {
            unreachable!()
        };

        h.engine
            .resume_approval(
                &approval_id,
                ApprovalDecision::Rejected {
                    decided_by: "bob".to_string(),
                    reason: Some("not in this release".to_string()),
                },
            )
            .await
            .unwrap();
        wait_terminal(&mut rx, &run_id).await;

        let view = h.engine.get_run(&run_id).await.unwrap();
        assert_eq!(view.run.status, RunStatus::Failed);
        let deploy = view
            .node_runs
            .iter()
            .find(|r| r.node_id == "deploy")
            .unwrap();
        assert_eq!(deploy.status, NodeRunStatus::Failed);
        assert_eq!(
            deploy.error_kind,
            Some(weir_core::error::FailureKind::ApprovalRejected)
        );
        let after = view
            .node_runs
            .iter()
            .find(|r| r.node_id == "after")
            .unwrap();
        assert_eq!(after.status, NodeRunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cancel_tears_down_in_flight_work() {
        let h = harness();
        let def = definition(
            "wf-cancel",
            vec![
                node("long", "slow", json!({}), &[]),
                node("after", "emit", json!({}), &["long"]),
            ],
        );
        h.store.put_workflow(&def).await.unwrap();
        let mut rx = h.bus.subscribe();

        let run_id = h
            .engine
            .trigger_run(&def, json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        recv_until(&mut rx, |e| {
            matches!(e, EngineEvent::NodeDispatched { node_id, .. } if node_id == "long")
        })
        .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        h.engine.cancel_run(&run_id).await.unwrap();
        let event = wait_terminal(&mut rx, &run_id).await;
        assert!(matches!(event, EngineEvent::RunCancelled { .. }));

        let view = h.engine.get_run(&run_id).await.unwrap();
        assert_eq!(view.run.status, RunStatus::Cancelled);
        assert!(view
            .node_runs
            .iter()
            .all(|r| r.status == NodeRunStatus::Skipped));

        // No environment survives cancellation.
        let mut entries = tokio::fs::read_dir(h.root.path().join("envs")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_of_terminal_run_is_an_error() {
        let h = harness();
        let def = definition("wf-done", vec![node("a", "emit", json!({}), &[])]);
        h.store.put_workflow(&def).await.unwrap();
        let mut rx = h.bus.subscribe();

        let run_id = h
            .engine
            .trigger_run(&def, json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        wait_terminal(&mut rx, &run_id).await;
        // The driver unregisters just after the terminal event.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = h.engine.cancel_run(&run_id).await.unwrap_err();
        assert!(err.to_string().contains("already success"));
    }

    #[tokio::test]
    async fn test_retry_reruns_only_failed_node() {
        let h = harness();
        let def = definition(
            "wf-retry",
            vec![
                node("a", "emit", json!({}), &[]),
                node("b", "flagged", json!({"from": "{{a.output.val}}"}), &["a"]),
            ],
        );
        h.store.put_workflow(&def).await.unwrap();
        let mut rx = h.bus.subscribe();

        let first = h
            .engine
            .trigger_run(&def, json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        wait_terminal(&mut rx, &first).await;
        assert_eq!(
            h.store.get_run(&first).await.unwrap().status,
            RunStatus::Failed
        );

        // Now the flag exists, so b can succeed.
        tokio::fs::write(h.root.path().join("flag"), b"ok").await.unwrap();

        let second = h.engine.retry_run(&first).await.unwrap();
        let event = wait_terminal(&mut rx, &second).await;
        assert!(matches!(event, EngineEvent::RunSuccess { .. }));

        let view = h.engine.get_run(&second).await.unwrap();
        assert_eq!(view.run.trigger_kind, TriggerKind::Retry);
        assert_eq!(view.run.parent_run_id.as_ref(), Some(&first));
        // a's prior output was reused, not re-executed.
        assert_eq!(view.node_runs.len(), 1);
        assert_eq!(view.node_runs[0].node_id, "b");
        assert_eq!(view.node_runs[0].resolved_input, json!({"from": 7}));
    }

    #[tokio::test]
    async fn test_retry_of_successful_run_is_refused() {
        let h = harness();
        let def = definition("wf-ok", vec![node("a", "emit", json!({}), &[])]);
        h.store.put_workflow(&def).await.unwrap();
        let mut rx = h.bus.subscribe();

        let run_id = h
            .engine
            .trigger_run(&def, json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        wait_terminal(&mut rx, &run_id).await;

        let err = h.engine.retry_run(&run_id).await.unwrap_err();
        assert!(err.to_string().contains("only failed or cancelled"));
    }

    #[tokio::test]
    async fn test_chain_depth_cap_refuses_runaway_triggers() {
        let h = harness();
        let def = definition("wf-chain", vec![node("a", "emit", json!({}), &[])]);
        let mut parent = Run::new(&def, TriggerKind::Auto, json!({}));
        parent.chain_depth = 8;

        let err = h
            .engine
            .trigger_chained(&def, json!({}), &parent)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chain depth"));
        assert!(h.store.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_field_fails_node_permanently() {
        let h = harness();
        let def = definition(
            "wf-badref",
            vec![
                node("a", "emit", json!({}), &[]),
                node("b", "echo", json!({"x": "{{a.output.missing}}"}), &["a"]),
            ],
        );
        h.store.put_workflow(&def).await.unwrap();
        let mut rx = h.bus.subscribe();

        let run_id = h
            .engine
            .trigger_run(&def, json!({}), TriggerKind::Manual)
            .await
            .unwrap();
        wait_terminal(&mut rx, &run_id).await;

        let view = h.engine.get_run(&run_id).await.unwrap();
        assert_eq!(view.run.status, RunStatus::Failed);
        let b = view.node_runs.iter().find(|r| r.node_id == "b").unwrap();
        assert_eq!(b.status, NodeRunStatus::Failed);
        assert_eq!(b.error_kind, Some(weir_core::error::FailureKind::Permanent));
        assert!(b.error.as_ref().unwrap().contains("missing"));
    }
}
