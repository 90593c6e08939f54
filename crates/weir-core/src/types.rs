use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::FailureKind;

/// Unique run identifier. Storage-generated; never used for dependency
/// tracking, which is keyed by symbolic node ids.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique node-run identifier (one execution attempt of one node).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeRunId(pub String);

impl NodeRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for NodeRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique approval identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

impl ApprovalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Draft,
    #[default]
    Active,
    Archived,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

/// How a workflow gets triggered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    #[default]
    Manual,
    /// Cron expression, evaluated in UTC.
    Scheduled { cron: String },
    /// Fire when another workflow's run reaches a terminal status.
    Event {
        workflow: String,
        #[serde(default)]
        on: EventTriggerOn,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventTriggerOn {
    #[default]
    Success,
    Failed,
    Any,
}

/// Immutable-per-version description of a workflow DAG.
///
/// Authored externally; the engine consumes it read-only. Serialization must
/// preserve `depends_on` edges exactly; symbolic ids are never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    /// Owning project scope. Required: runs and node runs inherit it.
    pub project_id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn node(&self, symbolic_id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == symbolic_id)
    }
}

/// One DAG vertex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Stable, author-chosen symbolic identifier. Dependencies and input
    /// templates reference nodes by this id, never by storage ids.
    pub id: String,
    /// Agent reference, resolved through the capability registry.
    pub agent: String,
    pub action: String,
    /// Input template; may contain `{{<symbolicId>.output.<field>}}`
    /// placeholders resolved at dispatch time.
    #[serde(default)]
    pub input: Value,
    /// Symbolic ids of predecessor nodes. Empty for root nodes.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub approval_required: bool,
}

/// What caused a run to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
    Retry,
    Auto,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Retry => "retry",
            TriggerKind::Auto => "auto",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerKind::Manual),
            "retry" => Ok(TriggerKind::Retry),
            "auto" => Ok(TriggerKind::Auto),
            _ => Err(format!("unknown trigger kind: {}", s)),
        }
    }
}

/// Status of a run. Terminal once success/failed/cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// Still running conceptually; at least one node awaits a decision.
    WaitingApproval,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::WaitingApproval => "waiting_approval",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "waiting_approval" => Ok(RunStatus::WaitingApproval),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(format!("unknown run status: {}", s)),
        }
    }
}

/// One execution instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: String,
    pub project_id: String,
    pub trigger_kind: TriggerKind,
    /// Original run when this is a retry resumption.
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
    /// Length of the auto-trigger chain that produced this run. Manual and
    /// retry triggers reset it to zero.
    #[serde(default)]
    pub chain_depth: u32,
    #[serde(default)]
    pub context: Value,
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(def: &WorkflowDefinition, trigger_kind: TriggerKind, context: Value) -> Self {
        Self {
            id: RunId::new(),
            workflow_id: def.id.clone(),
            project_id: def.project_id.clone(),
            trigger_kind,
            parent_run_id: None,
            chain_depth: 0,
            context,
            status: RunStatus::Pending,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Status of one node-run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Dispatched,
    Running,
    Success,
    Failed,
    Skipped,
    AwaitingApproval,
}

impl NodeRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeRunStatus::Success | NodeRunStatus::Failed | NodeRunStatus::Skipped
        )
    }
}

impl std::fmt::Display for NodeRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeRunStatus::Pending => "pending",
            NodeRunStatus::Dispatched => "dispatched",
            NodeRunStatus::Running => "running",
            NodeRunStatus::Success => "success",
            NodeRunStatus::Failed => "failed",
            NodeRunStatus::Skipped => "skipped",
            NodeRunStatus::AwaitingApproval => "awaiting_approval",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NodeRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NodeRunStatus::Pending),
            "dispatched" => Ok(NodeRunStatus::Dispatched),
            "running" => Ok(NodeRunStatus::Running),
            "success" => Ok(NodeRunStatus::Success),
            "failed" => Ok(NodeRunStatus::Failed),
            "skipped" => Ok(NodeRunStatus::Skipped),
            "awaiting_approval" => Ok(NodeRunStatus::AwaitingApproval),
            _ => Err(format!("unknown node run status: {}", s)),
        }
    }
}

/// One execution attempt of a single node within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRun {
    pub id: NodeRunId,
    pub run_id: RunId,
    /// Symbolic node id within the workflow definition.
    pub node_id: String,
    /// 1-based attempt counter across invoker retries.
    pub attempt: u32,
    pub status: NodeRunStatus,
    /// Owning project, inherited from the run. Required.
    pub project_id: String,
    /// Input after template substitution. Never contains secrets.
    #[serde(default)]
    pub resolved_input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error_kind: Option<FailureKind>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeRun {
    pub fn new(run: &Run, node_id: &str, attempt: u32) -> Self {
        Self {
            id: NodeRunId::new(),
            run_id: run.id.clone(),
            node_id: node_id.to_string(),
            attempt,
            status: NodeRunStatus::Pending,
            project_id: run.project_id.clone(),
            resolved_input: Value::Null,
            output: None,
            error_kind: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            _ => Err(format!("unknown approval status: {}", s)),
        }
    }
}

/// Human-in-the-loop gate attached to a node run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub run_id: RunId,
    pub node_id: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    /// When set, the gate auto-rejects past this instant.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// External decision resolving an approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved {
        decided_by: String,
    },
    Rejected {
        decided_by: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approved { .. })
    }

    pub fn decided_by(&self) -> &str {
        match self {
            ApprovalDecision::Approved { decided_by } => decided_by,
            ApprovalDecision::Rejected { decided_by, .. } => decided_by,
        }
    }
}

/// Everything an operator sees about one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    pub run: Run,
    pub node_runs: Vec<NodeRun>,
    pub approvals: Vec<Approval>,
}

/// Risk level supplied by the capability registry. Informational: gating is
/// driven by the node's `approval_required` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        write!(f, "{}", s)
    }
}

/// Agent capability metadata, supplied (not computed) by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Filled from the registry key when configured as a map entry.
    #[serde(default)]
    pub name: String,
    pub kind: AgentKind,
    #[serde(default)]
    pub risk: RiskLevel,
    /// Concurrency-limit bucket. Defaults to the agent name.
    #[serde(default)]
    pub integration: Option<String>,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_agent_timeout() -> u64 {
    300
}

impl AgentSpec {
    pub fn integration_key(&self) -> &str {
        self.integration.as_deref().unwrap_or(&self.name)
    }
}

/// How an agent executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentKind {
    /// Command run inside an isolated execution environment.
    Script {
        image: String,
        command: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        /// Injected into the environment at start time only; never persisted
        /// on runs, node runs, or build specs.
        #[serde(default)]
        secrets: HashMap<String, String>,
    },
    /// HTTP call to an external integration.
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Sent as a bearer credential; never logged or persisted.
        #[serde(default)]
        bearer_token: Option<String>,
    },
    /// Single-shot messages call to an LLM provider.
    Llm {
        model: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default = "default_llm_max_tokens")]
        max_tokens: u32,
    },
}

fn default_http_method() -> String {
    "POST".to_string()
}

fn default_llm_max_tokens() -> u32 {
    4096
}

/// Lifecycle events published on the bus. Every variant carries the run id
/// as its correlation identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    #[serde(rename = "run.started")]
    RunStarted { run_id: RunId, workflow_id: String },

    #[serde(rename = "run.success")]
    RunSuccess { run_id: RunId, workflow_id: String },

    #[serde(rename = "run.failed")]
    RunFailed {
        run_id: RunId,
        workflow_id: String,
        error: String,
    },

    #[serde(rename = "run.cancelled")]
    RunCancelled { run_id: RunId, workflow_id: String },

    #[serde(rename = "node.dispatched")]
    NodeDispatched {
        run_id: RunId,
        node_id: String,
        attempt: u32,
    },

    #[serde(rename = "node.success")]
    NodeSuccess { run_id: RunId, node_id: String },

    #[serde(rename = "node.failed")]
    NodeFailed {
        run_id: RunId,
        node_id: String,
        error_kind: FailureKind,
        error: String,
    },

    #[serde(rename = "node.skipped")]
    NodeSkipped { run_id: RunId, node_id: String },

    #[serde(rename = "approval.requested")]
    ApprovalRequested {
        run_id: RunId,
        node_id: String,
        approval_id: ApprovalId,
    },

    #[serde(rename = "approval.decided")]
    ApprovalDecided {
        run_id: RunId,
        approval_id: ApprovalId,
        approved: bool,
        decided_by: String,
    },
}

impl EngineEvent {
    /// Correlation identifier: the run this event belongs to.
    pub fn run_id(&self) -> &RunId {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::RunSuccess { run_id, .. }
            | EngineEvent::RunFailed { run_id, .. }
            | EngineEvent::RunCancelled { run_id, .. }
            | EngineEvent::NodeDispatched { run_id, .. }
            | EngineEvent::NodeSuccess { run_id, .. }
            | EngineEvent::NodeFailed { run_id, .. }
            | EngineEvent::NodeSkipped { run_id, .. }
            | EngineEvent::ApprovalRequested { run_id, .. }
            | EngineEvent::ApprovalDecided { run_id, .. } => run_id,
        }
    }

    /// True for events that end a run's lifecycle.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::RunSuccess { .. }
                | EngineEvent::RunFailed { .. }
                | EngineEvent::RunCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf-1".into(),
            project_id: "proj-1".into(),
            name: "compliance-scan".into(),
            version: 1,
            nodes: vec![
                WorkflowNode {
                    id: "fetch".into(),
                    agent: "fetcher".into(),
                    action: "pull".into(),
                    input: serde_json::json!({"source": "s3"}),
                    depends_on: vec![],
                    approval_required: false,
                },
                WorkflowNode {
                    id: "scan".into(),
                    agent: "scanner".into(),
                    action: "analyze".into(),
                    input: serde_json::json!({"doc": "{{fetch.output.path}}"}),
                    depends_on: vec!["fetch".into()],
                    approval_required: true,
                },
            ],
            trigger: TriggerSpec::Manual,
            status: WorkflowStatus::Active,
        }
    }

    #[test]
    fn test_definition_roundtrip_preserves_edges() {
        let def = sample_definition();
        let json = serde_json::to_string(&def).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes[1].depends_on, vec!["fetch".to_string()]);
        assert_eq!(back.nodes[1].id, "scan");
        assert_eq!(back.nodes[0].depends_on, Vec::<String>::new());
    }

    #[test]
    fn test_trigger_spec_tagged_parse() {
        let toml_str = r#"
kind = "scheduled"
cron = "0 0 * * * *"
"#;
        let spec: TriggerSpec = toml::from_str(toml_str).unwrap();
        assert_eq!(
            spec,
            TriggerSpec::Scheduled {
                cron: "0 0 * * * *".into()
            }
        );
    }

    #[test]
    fn test_event_correlation_id() {
        let run_id = RunId::from_str("r-1");
        let ev = EngineEvent::NodeFailed {
            run_id: run_id.clone(),
            node_id: "scan".into(),
            error_kind: FailureKind::Timeout,
            error: "timed out".into(),
        };
        assert_eq!(ev.run_id(), &run_id);
        assert!(!ev.is_run_terminal());
        assert!(EngineEvent::RunCancelled {
            run_id,
            workflow_id: "wf-1".into()
        }
        .is_run_terminal());
    }

    #[test]
    fn test_event_serializes_dotted_names() {
        let ev = EngineEvent::ApprovalRequested {
            run_id: RunId::from_str("r-1"),
            node_id: "scan".into(),
            approval_id: ApprovalId::from_str("a-1"),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "approval.requested");
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::WaitingApproval.is_terminal());
        let parsed: RunStatus = "waiting_approval".parse().unwrap();
        assert_eq!(parsed, RunStatus::WaitingApproval);
    }

    #[test]
    fn test_agent_spec_integration_key_falls_back_to_name() {
        let spec = AgentSpec {
            name: "scanner".into(),
            kind: AgentKind::Http {
                url: "https://example.test/scan".into(),
                method: default_http_method(),
                headers: HashMap::new(),
                bearer_token: None,
            },
            risk: RiskLevel::Medium,
            integration: None,
            timeout_secs: 60,
        };
        assert_eq!(spec.integration_key(), "scanner");
    }
}
