use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use weir_core::error::{Result, WeirError};
use weir_core::types::{NodeRunStatus, TriggerSpec, WorkflowDefinition, WorkflowNode};

/// Reject a malformed definition before any run state exists.
///
/// Checks, in order: project scope present, at least one node, unique
/// symbolic ids, `depends_on` entries that resolve, acyclicity (Kahn's
/// algorithm; the offending ids are named in the error), input templates
/// confined to each node's transitive dependency closure, and a parseable
/// cron expression on scheduled triggers.
pub fn validate(def: &WorkflowDefinition) -> Result<()> {
    if def.project_id.trim().is_empty() {
        return Err(WeirError::Validation(format!(
            "workflow '{}' has no project_id",
            def.id
        )));
    }
    if def.nodes.is_empty() {
        return Err(WeirError::Validation(format!(
            "workflow '{}' defines no nodes",
            def.id
        )));
    }

    let mut ids: HashSet<&str> = HashSet::with_capacity(def.nodes.len());
    for node in &def.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(WeirError::Validation(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
    }

    for node in &def.nodes {
        for dep in &node.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(WeirError::Validation(format!(
                    "node '{}' depends on '{}', which is not defined",
                    node.id, dep
                )));
            }
        }
    }

    check_acyclic(def)?;

    // A template reference outside the referencing node's transitive
    // dependencies could never have a completed output at dispatch time.
    let closures = dependency_closures(def);
    for node in &def.nodes {
        let refs = weir_invoker::template::referenced_nodes(&node.input);
        if refs.is_empty() {
            continue;
        }
        let reachable = closures.get(node.id.as_str()).ok_or_else(|| {
            WeirError::InternalConsistency(format!("no dependency closure for '{}'", node.id))
        })?;
        for referenced in refs {
            if !reachable.contains(referenced.as_str()) {
                return Err(WeirError::Validation(format!(
                    "node '{}' input references '{}', which is not among its dependencies",
                    node.id, referenced
                )));
            }
        }
    }

    if let TriggerSpec::Scheduled { cron } = &def.trigger {
        cron::Schedule::from_str(cron).map_err(|e| {
            WeirError::Validation(format!(
                "workflow '{}' has an invalid cron expression '{}': {}",
                def.id, cron, e
            ))
        })?;
    }

    Ok(())
}

/// Nodes eligible for dispatch right now: still pending, with every
/// dependency in `completed`. Roots are ready immediately. The batch is
/// unordered and meant to be dispatched in full.
pub fn ready_batch<'a>(
    def: &'a WorkflowDefinition,
    completed: &HashSet<String>,
    statuses: &HashMap<String, NodeRunStatus>,
) -> Vec<&'a WorkflowNode> {
    def.nodes
        .iter()
        .filter(|node| {
            let pending = statuses
                .get(&node.id)
                .map_or(true, |s| *s == NodeRunStatus::Pending);
            pending && node.depends_on.iter().all(|dep| completed.contains(dep))
        })
        .collect()
}

/// Kahn traversal over symbolic ids. Anything left with residual in-degree
/// sits on or behind a cycle and is reported by id.
fn check_acyclic(def: &WorkflowDefinition) -> Result<()> {
    let mut in_degree: HashMap<&str, usize> = def
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &def.nodes {
        for dep in &node.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(node.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if visited == def.nodes.len() {
        return Ok(());
    }
    let mut nodes: Vec<String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree > 0)
        .map(|(id, _)| id.to_string())
        .collect();
    nodes.sort();
    Err(WeirError::Cycle { nodes })
}

/// Transitive dependency closure per node, keyed by symbolic id.
fn dependency_closures(def: &WorkflowDefinition) -> HashMap<&str, HashSet<&str>> {
    let by_id: HashMap<&str, &WorkflowNode> =
        def.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut closures = HashMap::with_capacity(def.nodes.len());
    for node in &def.nodes {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = node.depends_on.iter().map(String::as_str).collect();
        while let Some(dep) = stack.pop() {
            if !seen.insert(dep) {
                continue;
            }
            if let Some(n) = by_id.get(dep) {
                stack.extend(n.depends_on.iter().map(String::as_str));
            }
        }
        closures.insert(node.id.as_str(), seen);
    }
    closures
}
