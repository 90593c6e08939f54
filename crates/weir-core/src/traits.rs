use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Durable persistence for workflow definitions, runs, node runs, and
/// approvals. The single source of truth: every status transition lands
/// here before the engine acts on it.
pub trait RunStore: Send + Sync + 'static {
    /// Register or replace a workflow definition.
    fn put_workflow(&self, def: &WorkflowDefinition) -> BoxFuture<'_, Result<()>>;

    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<WorkflowDefinition>>;

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<WorkflowDefinition>>>;

    fn create_run(&self, run: &Run) -> BoxFuture<'_, Result<()>>;

    /// Persist the run's mutable fields (status, error, timestamps).
    fn update_run(&self, run: &Run) -> BoxFuture<'_, Result<()>>;

    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Run>>;

    /// Most recent runs first.
    fn list_runs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Run>>>;

    fn create_node_run(&self, node_run: &NodeRun) -> BoxFuture<'_, Result<()>>;

    fn update_node_run(&self, node_run: &NodeRun) -> BoxFuture<'_, Result<()>>;

    /// All attempts for a run, oldest first.
    fn node_runs(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<NodeRun>>>;

    /// Latest attempt per symbolic node id. Only these count toward
    /// dependency completion.
    fn latest_node_runs(
        &self,
        run_id: &RunId,
    ) -> BoxFuture<'_, Result<HashMap<String, NodeRun>>>;

    fn create_approval(&self, approval: &Approval) -> BoxFuture<'_, Result<()>>;

    fn update_approval(&self, approval: &Approval) -> BoxFuture<'_, Result<()>>;

    fn get_approval(&self, id: &ApprovalId) -> BoxFuture<'_, Result<Approval>>;

    fn pending_approvals(&self) -> BoxFuture<'_, Result<Vec<Approval>>>;

    /// All approvals attached to a run, oldest first.
    fn run_approvals(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Approval>>>;

    /// Terminal bookkeeping in one transaction: write the run's final state
    /// and insert skip records for nodes that never ran.
    fn finish_run(&self, run: &Run, skipped: &[NodeRun]) -> BoxFuture<'_, Result<()>>;

    /// Ids of runs with any node run still dispatched or running. Used by
    /// the startup orphan sweep.
    fn active_run_ids(&self) -> BoxFuture<'_, Result<Vec<RunId>>>;
}

/// Agent capability metadata, looked up by agent reference.
/// Read-only: the registry supplies specs, the engine never writes them.
pub trait AgentRegistry: Send + Sync + 'static {
    fn get(&self, agent_ref: &str) -> BoxFuture<'_, Result<AgentSpec>>;

    fn names(&self) -> Vec<String>;
}
