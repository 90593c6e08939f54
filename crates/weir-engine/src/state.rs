//! Per-run state machine.
//!
//! Exactly one driver task owns a `RunMachine`, so every workflow_runs /
//! node_runs write for a run goes through one place, in order. Node tasks
//! report progress back through [`NodeSignal`] and their join results; they
//! never touch the store themselves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use weir_core::error::{FailureKind, Result, WeirError};
use weir_core::event::EventBus;
use weir_core::traits::RunStore;
use weir_core::types::{
    EngineEvent, NodeRun, NodeRunStatus, Run, RunStatus, WorkflowDefinition, WorkflowNode,
};
use weir_invoker::NodeOutcome;

use crate::dag;

/// Progress report from a spawned node task to its run driver.
#[derive(Debug)]
pub enum NodeSignal {
    /// A gated node's approval came back approved.
    Approved { node_id: String },
    /// The node task is past setup and invoking its agent.
    Started { node_id: String },
}

pub struct RunMachine {
    store: Arc<dyn RunStore>,
    bus: Arc<EventBus>,
    def: WorkflowDefinition,
    run: Run,
    max_retries: u32,
    /// Outputs of completed nodes, keyed by symbolic id. Template resolution
    /// reads from here.
    outputs: HashMap<String, Value>,
    /// Lifecycle of every node touched so far, keyed by symbolic id.
    statuses: HashMap<String, NodeRunStatus>,
    /// In-flight node_runs rows. Removed once terminal.
    rows: HashMap<String, NodeRun>,
    /// First terminal node failure: (node id, error message).
    failure: Option<(String, String)>,
}

impl RunMachine {
    pub fn new(
        store: Arc<dyn RunStore>,
        bus: Arc<EventBus>,
        def: WorkflowDefinition,
        run: Run,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            bus,
            def,
            run,
            max_retries,
            outputs: HashMap::new(),
            statuses: HashMap::new(),
            rows: HashMap::new(),
            failure: None,
        }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    /// First node failure observed, if any. The run's error message is
    /// derived from this.
    pub fn failure(&self) -> Option<&(String, String)> {
        self.failure.as_ref()
    }

    pub fn all_succeeded(&self) -> bool {
        self.def
            .nodes
            .iter()
            .all(|n| self.statuses.get(&n.id) == Some(&NodeRunStatus::Success))
    }

    pub fn awaiting_approval_count(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| **s == NodeRunStatus::AwaitingApproval)
            .count()
    }

    /// Nodes eligible for dispatch right now.
    pub fn ready(&self) -> Vec<WorkflowNode> {
        let completed: HashSet<String> = self
            .statuses
            .iter()
            .filter(|(_, s)| **s == NodeRunStatus::Success)
            .map(|(id, _)| id.clone())
            .collect();
        dag::ready_batch(&self.def, &completed, &self.statuses)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Treat these nodes as already succeeded, with the given outputs. Used
    /// by retry runs to resume from the parent's completed work; no node_runs
    /// rows are written for them.
    pub fn seed_completed(&mut self, prior: HashMap<String, Value>) {
        for (node_id, output) in prior {
            self.statuses
                .insert(node_id.clone(), NodeRunStatus::Success);
            self.outputs.insert(node_id, output);
        }
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.run.status = RunStatus::Running;
        self.run.started_at = Some(Utc::now());
        self.store.update_run(&self.run).await?;
        info!(
            run_id = %self.run.id,
            workflow_id = %self.run.workflow_id,
            trigger = %self.run.trigger_kind,
            "Run started"
        );
        self.bus.publish(EngineEvent::RunStarted {
            run_id: self.run.id.clone(),
            workflow_id: self.run.workflow_id.clone(),
        });
        Ok(())
    }

    /// Create the node_runs row for an ungated node and announce dispatch.
    pub async fn mark_dispatched(&mut self, node_id: &str, resolved_input: Value) -> Result<()> {
        let mut row = NodeRun::new(&self.run, node_id, 1);
        row.status = NodeRunStatus::Dispatched;
        row.resolved_input = resolved_input;
        self.store.create_node_run(&row).await?;
        self.statuses
            .insert(node_id.to_string(), NodeRunStatus::Dispatched);
        debug!(run_id = %self.run.id, node_id, "Node dispatched");
        self.bus.publish(EngineEvent::NodeDispatched {
            run_id: self.run.id.clone(),
            node_id: node_id.to_string(),
            attempt: row.attempt,
        });
        self.rows.insert(node_id.to_string(), row);
        Ok(())
    }

    /// Create the node_runs row for a gated node and park the run in
    /// waiting_approval if nothing else is running it forward.
    pub async fn mark_awaiting_approval(
        &mut self,
        node_id: &str,
        resolved_input: Value,
    ) -> Result<()> {
        let mut row = NodeRun::new(&self.run, node_id, 1);
        row.status = NodeRunStatus::AwaitingApproval;
        row.resolved_input = resolved_input;
        self.store.create_node_run(&row).await?;
        self.statuses
            .insert(node_id.to_string(), NodeRunStatus::AwaitingApproval);
        self.rows.insert(node_id.to_string(), row);
        if self.run.status == RunStatus::Running {
            self.run.status = RunStatus::WaitingApproval;
            self.store.update_run(&self.run).await?;
        }
        Ok(())
    }

    pub async fn apply_signal(&mut self, signal: NodeSignal) -> Result<()> {
        match signal {
            NodeSignal::Approved { node_id } => self.mark_approved(&node_id).await,
            NodeSignal::Started { node_id } => self.mark_running(&node_id).await,
        }
    }

    /// Gated node cleared its gate: awaiting_approval -> dispatched, and the
    /// run resumes once no other node is waiting.
    async fn mark_approved(&mut self, node_id: &str) -> Result<()> {
        let Some(row) = self.rows.get_mut(node_id) else {
            return Ok(());
        };
        if row.status != NodeRunStatus::AwaitingApproval {
            return Ok(());
        }
        row.status = NodeRunStatus::Dispatched;
        self.store.update_node_run(row).await?;
        let attempt = row.attempt;
        self.statuses
            .insert(node_id.to_string(), NodeRunStatus::Dispatched);
        self.bus.publish(EngineEvent::NodeDispatched {
            run_id: self.run.id.clone(),
            node_id: node_id.to_string(),
            attempt,
        });
        if self.run.status == RunStatus::WaitingApproval && self.awaiting_approval_count() == 0 {
            self.run.status = RunStatus::Running;
            self.store.update_run(&self.run).await?;
        }
        Ok(())
    }

    async fn mark_running(&mut self, node_id: &str) -> Result<()> {
        let Some(row) = self.rows.get_mut(node_id) else {
            // Completion already processed; the signal arrived late.
            return Ok(());
        };
        if row.status != NodeRunStatus::Dispatched {
            return Ok(());
        }
        row.status = NodeRunStatus::Running;
        row.started_at = Some(Utc::now());
        self.store.update_node_run(row).await?;
        self.statuses
            .insert(node_id.to_string(), NodeRunStatus::Running);
        Ok(())
    }

    /// Record a node task's final result.
    pub async fn complete_node(
        &mut self,
        node_id: &str,
        result: std::result::Result<NodeOutcome, WeirError>,
    ) -> Result<()> {
        let Some(mut row) = self.rows.remove(node_id) else {
            return Err(WeirError::InternalConsistency(format!(
                "completion for unknown node '{}'",
                node_id
            )));
        };
        row.finished_at = Some(Utc::now());
        match result {
            Ok(outcome) => {
                row.status = NodeRunStatus::Success;
                row.attempt = outcome.attempts;
                row.output = Some(outcome.output.clone());
                self.store.update_node_run(&row).await?;
                self.statuses
                    .insert(node_id.to_string(), NodeRunStatus::Success);
                self.outputs.insert(node_id.to_string(), outcome.output);
                info!(
                    run_id = %self.run.id,
                    node_id,
                    attempts = row.attempt,
                    "Node succeeded"
                );
                self.bus.publish(EngineEvent::NodeSuccess {
                    run_id: self.run.id.clone(),
                    node_id: node_id.to_string(),
                });
            }
            Err(WeirError::Cancelled) => {
                // Torn down mid-flight; the node neither succeeded nor
                // failed on its own terms.
                row.status = NodeRunStatus::Skipped;
                self.store.update_node_run(&row).await?;
                self.statuses
                    .insert(node_id.to_string(), NodeRunStatus::Skipped);
                debug!(run_id = %self.run.id, node_id, "In-flight node skipped");
                self.bus.publish(EngineEvent::NodeSkipped {
                    run_id: self.run.id.clone(),
                    node_id: node_id.to_string(),
                });
            }
            Err(e) => {
                let kind = e.failure_kind();
                if e.is_retryable() {
                    // Retryable errors only surface once the whole retry
                    // budget is spent.
                    row.attempt = self.max_retries + 1;
                }
                row.status = NodeRunStatus::Failed;
                row.error_kind = Some(kind);
                row.error = Some(e.to_string());
                self.store.update_node_run(&row).await?;
                self.statuses
                    .insert(node_id.to_string(), NodeRunStatus::Failed);
                if kind == FailureKind::InternalConsistency {
                    error!(run_id = %self.run.id, node_id, error = %e, "Internal consistency violation");
                } else {
                    warn!(run_id = %self.run.id, node_id, kind = %kind, error = %e, "Node failed");
                }
                self.bus.publish(EngineEvent::NodeFailed {
                    run_id: self.run.id.clone(),
                    node_id: node_id.to_string(),
                    error_kind: kind,
                    error: e.to_string(),
                });
                if self.failure.is_none() {
                    self.failure = Some((node_id.to_string(), e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Record a failure for a node that never got dispatched, e.g. its input
    /// template would not resolve.
    pub async fn mark_failed_undispatched(
        &mut self,
        node_id: &str,
        error: &WeirError,
    ) -> Result<()> {
        let kind = error.failure_kind();
        let mut row = NodeRun::new(&self.run, node_id, 1);
        row.status = NodeRunStatus::Failed;
        row.error_kind = Some(kind);
        row.error = Some(error.to_string());
        row.finished_at = Some(Utc::now());
        self.store.create_node_run(&row).await?;
        self.statuses
            .insert(node_id.to_string(), NodeRunStatus::Failed);
        if kind == FailureKind::InternalConsistency {
            error!(run_id = %self.run.id, node_id, error = %error, "Internal consistency violation");
        } else {
            warn!(run_id = %self.run.id, node_id, kind = %kind, error = %error, "Node failed before dispatch");
        }
        self.bus.publish(EngineEvent::NodeFailed {
            run_id: self.run.id.clone(),
            node_id: node_id.to_string(),
            error_kind: kind,
            error: error.to_string(),
        });
        if self.failure.is_none() {
            self.failure = Some((node_id.to_string(), error.to_string()));
        }
        Ok(())
    }

    pub async fn finish_success(&mut self) -> Result<()> {
        self.run.status = RunStatus::Success;
        self.run.finished_at = Some(Utc::now());
        self.store.finish_run(&self.run, &[]).await?;
        info!(
            run_id = %self.run.id,
            workflow_id = %self.run.workflow_id,
            "Run succeeded"
        );
        self.bus.publish(EngineEvent::RunSuccess {
            run_id: self.run.id.clone(),
            workflow_id: self.run.workflow_id.clone(),
        });
        Ok(())
    }

    pub async fn finish_failed(&mut self, error: String) -> Result<()> {
        let skips = self.skip_untouched();
        self.run.status = RunStatus::Failed;
        self.run.error = Some(error.clone());
        self.run.finished_at = Some(Utc::now());
        self.store.finish_run(&self.run, &skips).await?;
        self.publish_skips(&skips);
        warn!(
            run_id = %self.run.id,
            workflow_id = %self.run.workflow_id,
            error = %error,
            "Run failed"
        );
        self.bus.publish(EngineEvent::RunFailed {
            run_id: self.run.id.clone(),
            workflow_id: self.run.workflow_id.clone(),
            error,
        });
        Ok(())
    }

    pub async fn finish_cancelled(&mut self) -> Result<()> {
        let skips = self.skip_untouched();
        self.run.status = RunStatus::Cancelled;
        self.run.finished_at = Some(Utc::now());
        self.store.finish_run(&self.run, &skips).await?;
        self.publish_skips(&skips);
        info!(
            run_id = %self.run.id,
            workflow_id = %self.run.workflow_id,
            "Run cancelled"
        );
        self.bus.publish(EngineEvent::RunCancelled {
            run_id: self.run.id.clone(),
            workflow_id: self.run.workflow_id.clone(),
        });
        Ok(())
    }

    /// Skip rows for nodes that never got a node_runs row. Nodes that were
    /// in flight when the run ended are settled by `complete_node` during
    /// teardown, before the finish methods run.
    fn skip_untouched(&mut self) -> Vec<NodeRun> {
        let mut skips = Vec::new();
        for node in &self.def.nodes {
            let untouched = self
                .statuses
                .get(&node.id)
                .map_or(true, |s| *s == NodeRunStatus::Pending);
            if !untouched {
                continue;
            }
            let mut row = NodeRun::new(&self.run, &node.id, 1);
            row.status = NodeRunStatus::Skipped;
            row.finished_at = Some(Utc::now());
            self.statuses
                .insert(node.id.clone(), NodeRunStatus::Skipped);
            skips.push(row);
        }
        skips
    }

    // Skip events go out before the run's terminal event.
    fn publish_skips(&self, skips: &[NodeRun]) {
        for row in skips {
            self.bus.publish(EngineEvent::NodeSkipped {
                run_id: self.run.id.clone(),
                node_id: row.node_id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weir_core::types::{TriggerKind, TriggerSpec, WorkflowStatus};
    use weir_store::SqliteRunStore;

    fn node(id: &str, depends_on: &[&str]) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            agent: "sh".to_string(),
            action: "run".to_string(),
            input: json!({}),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            approval_required: false,
        }
    }

    fn chain_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf-chain".to_string(),
            project_id: "proj-1".to_string(),
            name: "chain".to_string(),
            version: 1,
            nodes: vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])],
            trigger: TriggerSpec::Manual,
            status: WorkflowStatus::Active,
        }
    }

    async fn machine_for(def: WorkflowDefinition) -> (RunMachine, Arc<dyn RunStore>, Arc<EventBus>) {
        let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::in_memory().unwrap());
        let bus = Arc::new(EventBus::default());
        store.put_workflow(&def).await.unwrap();
        let run = Run::new(&def, TriggerKind::Manual, json!({}));
        store.create_run(&run).await.unwrap();
        let machine = RunMachine::new(store.clone(), bus.clone(), def, run, 3);
        (machine, store, bus)
    }

    fn outcome(output: Value, attempts: u32) -> NodeOutcome {
        NodeOutcome { output, attempts }
    }

    #[tokio::test]
    async fn test_begin_marks_run_running() {
        let (mut machine, store, bus) = machine_for(chain_definition()).await;
        let mut rx = bus.subscribe();
        machine.begin().await.unwrap();

        let stored = store.get_run(&machine.run().id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert!(stored.started_at.is_some());
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::RunStarted { .. }
        ));
    }

    #[tokio::test]
    async fn test_dispatch_then_success_records_output() {
        let (mut machine, store, _bus) = machine_for(chain_definition()).await;
        machine.begin().await.unwrap();
        machine
            .mark_dispatched("a", json!({"cmd": "true"}))
            .await
            .unwrap();
        machine
            .complete_node("a", Ok(outcome(json!({"x": 1}), 2)))
            .await
            .unwrap();

        let rows = store.node_runs(&machine.run().id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, NodeRunStatus::Success);
        assert_eq!(rows[0].attempt, 2);
        assert_eq!(rows[0].output, Some(json!({"x": 1})));
        assert_eq!(machine.outputs().get("a"), Some(&json!({"x": 1})));
        assert!(machine.failure().is_none());
    }

    #[tokio::test]
    async fn test_retryable_failure_charges_full_budget() {
        let (mut machine, store, _bus) = machine_for(chain_definition()).await;
        machine.begin().await.unwrap();
        machine.mark_dispatched("a", json!({})).await.unwrap();
        machine
            .complete_node("a", Err(WeirError::Transient("503".into())))
            .await
            .unwrap();

        let rows = store.node_runs(&machine.run().id).await.unwrap();
        assert_eq!(rows[0].status, NodeRunStatus::Failed);
        assert_eq!(rows[0].attempt, 4);
        assert_eq!(rows[0].error_kind, Some(FailureKind::Transient));
        assert_eq!(machine.failure().unwrap().0, "a");
    }

    #[tokio::test]
    async fn test_permanent_failure_keeps_single_attempt() {
        let (mut machine, store, _bus) = machine_for(chain_definition()).await;
        machine.begin().await.unwrap();
        machine.mark_dispatched("a", json!({})).await.unwrap();
        machine
            .complete_node("a", Err(WeirError::Permanent("exit 7".into())))
            .await
            .unwrap();

        let rows = store.node_runs(&machine.run().id).await.unwrap();
        assert_eq!(rows[0].attempt, 1);
        assert_eq!(rows[0].error_kind, Some(FailureKind::Permanent));
    }

    #[tokio::test]
    async fn test_cancelled_completion_becomes_skipped() {
        let (mut machine, store, _bus) = machine_for(chain_definition()).await;
        machine.begin().await.unwrap();
        machine.mark_dispatched("a", json!({})).await.unwrap();
        machine
            .complete_node("a", Err(WeirError::Cancelled))
            .await
            .unwrap();

        let rows = store.node_runs(&machine.run().id).await.unwrap();
        assert_eq!(rows[0].status, NodeRunStatus::Skipped);
        // A teardown is not a node failure.
        assert!(machine.failure().is_none());
    }

    #[tokio::test]
    async fn test_approval_gate_parks_and_resumes_run() {
        let (mut machine, store, _bus) = machine_for(chain_definition()).await;
        machine.begin().await.unwrap();
        machine
            .mark_awaiting_approval("a", json!({"cmd": "rm"}))
            .await
            .unwrap();

        let stored = store.get_run(&machine.run().id).await.unwrap();
        assert_eq!(stored.status, RunStatus::WaitingApproval);
        assert_eq!(machine.awaiting_approval_count(), 1);

        machine
            .apply_signal(NodeSignal::Approved {
                node_id: "a".into(),
            })
            .await
            .unwrap();
        let stored = store.get_run(&machine.run().id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        let rows = store.node_runs(&machine.run().id).await.unwrap();
        assert_eq!(rows[0].status, NodeRunStatus::Dispatched);
    }

    #[tokio::test]
    async fn test_started_signal_sets_row_running() {
        let (mut machine, store, _bus) = machine_for(chain_definition()).await;
        machine.begin().await.unwrap();
        machine.mark_dispatched("a", json!({})).await.unwrap();
        machine
            .apply_signal(NodeSignal::Started {
                node_id: "a".into(),
            })
            .await
            .unwrap();

        let rows = store.node_runs(&machine.run().id).await.unwrap();
        assert_eq!(rows[0].status, NodeRunStatus::Running);
        assert!(rows[0].started_at.is_some());
    }

    #[tokio::test]
    async fn test_late_started_signal_is_ignored() {
        let (mut machine, store, _bus) = machine_for(chain_definition()).await;
        machine.begin().await.unwrap();
        machine.mark_dispatched("a", json!({})).await.unwrap();
        machine
            .complete_node("a", Ok(outcome(json!(null), 1)))
            .await
            .unwrap();
        machine
            .apply_signal(NodeSignal::Started {
                node_id: "a".into(),
            })
            .await
            .unwrap();

        let rows = store.node_runs(&machine.run().id).await.unwrap();
        assert_eq!(rows[0].status, NodeRunStatus::Success);
    }

    #[tokio::test]
    async fn test_finish_failed_skips_untouched_nodes() {
        let (mut machine, store, _bus) = machine_for(chain_definition()).await;
        machine.begin().await.unwrap();
        machine.mark_dispatched("a", json!({})).await.unwrap();
        machine
            .complete_node("a", Err(WeirError::Permanent("boom".into())))
            .await
            .unwrap();
        machine
            .finish_failed("node 'a' failed: boom".into())
            .await
            .unwrap();

        let run = store.get_run(&machine.run().id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("node 'a' failed: boom"));
        let rows = store.node_runs(&machine.run().id).await.unwrap();
        assert_eq!(rows.len(), 3);
        let skipped: Vec<_> = rows
            .iter()
            .filter(|r| r.status == NodeRunStatus::Skipped)
            .map(|r| r.node_id.as_str())
            .collect();
        assert_eq!(skipped, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_seeded_nodes_resume_without_new_rows() {
        let (mut machine, store, _bus) = machine_for(chain_definition()).await;
        machine.seed_completed(HashMap::from([("a".to_string(), json!({"x": 9}))]));
        machine.begin().await.unwrap();

        // a is done, so b is immediately ready.
        let ready: Vec<String> = machine.ready().into_iter().map(|n| n.id).collect();
        assert_eq!(ready, vec!["b"]);

        machine.mark_dispatched("b", json!({})).await.unwrap();
        machine
            .complete_node("b", Ok(outcome(json!(null), 1)))
            .await
            .unwrap();
        machine.mark_dispatched("c", json!({})).await.unwrap();
        machine
            .complete_node("c", Ok(outcome(json!(null), 1)))
            .await
            .unwrap();

        assert!(machine.all_succeeded());
        let rows = store.node_runs(&machine.run().id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.node_id != "a"));
    }

    #[tokio::test]
    async fn test_dispatched_node_leaves_ready_set() {
        let (mut machine, _store, _bus) = machine_for(chain_definition()).await;
        machine.begin().await.unwrap();
        assert_eq!(machine.ready().len(), 1);
        machine.mark_dispatched("a", json!({})).await.unwrap();
        assert!(machine.ready().is_empty());
    }
}
