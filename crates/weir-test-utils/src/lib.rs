//! Builders for integration tests. Everything defaults to the smallest
//! shape that passes validation; tests override what they care about.

use std::collections::HashMap;

use serde_json::Value;
use weir_core::types::{
    AgentKind, AgentSpec, RiskLevel, TriggerSpec, WorkflowDefinition, WorkflowNode, WorkflowStatus,
};

/// A workflow node with action "run" and no approval gate.
pub fn node(id: &str, agent: &str, input: Value, depends_on: &[&str]) -> WorkflowNode {
    WorkflowNode {
        id: id.to_string(),
        agent: agent.to_string(),
        action: "run".to_string(),
        input,
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        approval_required: false,
    }
}

/// Same as [`node`], but suspended on a human decision before dispatch.
pub fn gated_node(id: &str, agent: &str, input: Value, depends_on: &[&str]) -> WorkflowNode {
    WorkflowNode {
        approval_required: true,
        ..node(id, agent, input, depends_on)
    }
}

/// An active, manually triggered workflow in a fixture project.
pub fn definition(id: &str, nodes: Vec<WorkflowNode>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        project_id: "proj-test".to_string(),
        name: id.to_string(),
        version: 1,
        nodes,
        trigger: TriggerSpec::Manual,
        status: WorkflowStatus::Active,
    }
}

/// A `sh -c` script agent. The script sees its input at `$WEIR_INPUT` and
/// writes its output to `$WEIR_OUTPUT`.
pub fn script_agent(name: &str, script: &str, env: HashMap<String, String>) -> AgentSpec {
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
