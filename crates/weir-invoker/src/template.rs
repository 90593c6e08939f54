use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use weir_core::error::{Result, WeirError};

/// `{{ nodeId.output.field.path }}`: node ids and field segments only;
/// anything else in braces passes through untouched.
fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+)\.output\.([A-Za-z0-9_.\-]+)\s*\}\}").unwrap()
    })
}

/// Substitute placeholders in an input template against the outputs of
/// completed upstream nodes, keyed by symbolic node id.
///
/// A string that is exactly one placeholder takes the referenced value with
/// its type intact; placeholders embedded in longer strings interpolate as
/// text. Unresolvable references are errors, never silently dropped.
pub fn resolve(template: &Value, outputs: &HashMap<String, Value>) -> Result<Value> {
    match template {
        Value::String(s) => resolve_string(s, outputs),
        Value::Array(items) => {
            let resolved: Result<Vec<Value>> =
                items.iter().map(|v| resolve(v, outputs)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k.clone(), resolve(v, outputs)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Symbolic node ids referenced by a template. Validation checks these
/// against the node's transitive dependencies before a run starts.
pub fn referenced_nodes(template: &Value) -> HashSet<String> {
    let mut nodes = HashSet::new();
    collect_refs(template, &mut nodes);
    nodes
}

fn collect_refs(value: &Value, nodes: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            for caps in placeholder_re().captures_iter(s) {
                nodes.insert(caps[1].to_string());
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_refs(v, nodes);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_refs(v, nodes);
            }
        }
        _ => {}
    }
}

fn resolve_string(s: &str, outputs: &HashMap<String, Value>) -> Result<Value> {
    let re = placeholder_re();

    // Whole-string placeholder preserves the referenced value's type.
    if let Some(caps) = re.captures(s) {
        if caps.get(0).map(|m| m.as_str()) == Some(s) {
            return Ok(lookup(outputs, &caps[1], &caps[2])?.clone());
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let m = caps.get(0).ok_or_else(|| {
            WeirError::InternalConsistency("placeholder match without range".into())
        })?;
        out.push_str(&s[last..m.start()]);
        out.push_str(&value_to_text(lookup(outputs, &caps[1], &caps[2])?)?);
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

// Validation confines references to completed dependencies, so a missing
// node here is an engine bug, not an authoring mistake. A missing field is
// an output-schema violation by the upstream agent and is not retried.
fn lookup<'a>(
    outputs: &'a HashMap<String, Value>,
    node_id: &str,
    path: &str,
) -> Result<&'a Value> {
    let mut current = outputs.get(node_id).ok_or_else(|| {
        WeirError::InternalConsistency(format!(
            "input template references '{}', which has no completed output",
            node_id
        ))
    })?;
    for segment in path.split('.') {
        current = current.get(segment).ok_or_else(|| {
            WeirError::Permanent(format!(
                "output of '{}' has no field '{}'",
                node_id, path
            ))
        })?;
    }
    Ok(current)
}

fn value_to_text(value: &Value) -> Result<String> {
    Ok(match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        compound => serde_json::to_string(compound)?,
    })
}
