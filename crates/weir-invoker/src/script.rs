use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use weir_core::error::{Result, WeirError};
use weir_env::{EnvHandle, EnvSpec, EnvironmentBackend};

/// At most this much log text rides along on fallback outputs and errors.
const LOG_TAIL_BYTES: usize = 2000;

/// One script invocation: build an environment, run the command to
/// completion, collect its output file. The environment is stopped no
/// matter which step fails.
pub(crate) async fn run(
    backend: &dyn EnvironmentBackend,
    spec: EnvSpec,
    payload: &Value,
    secrets: HashMap<String, String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Value> {
    let handle = backend.build(spec).await?;
    for degradation in &handle.degradations {
        warn!(
            env_id = %handle.id,
            node_id = %handle.spec.node_id,
            "Environment degradation: {}",
            degradation
        );
    }

    let result = execute(backend, &handle, payload, secrets, timeout, cancel).await;
    if let Err(e) = backend.stop(&handle).await {
        warn!(env_id = %handle.id, error = %e, "Environment stop failed");
    }
    result
}

async fn execute(
    backend: &dyn EnvironmentBackend,
    handle: &EnvHandle,
    payload: &Value,
    secrets: HashMap<String, String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Value> {
    tokio::fs::write(
        handle.workdir.join("input.json"),
        serde_json::to_vec_pretty(payload)?,
    )
    .await?;

    backend.start(handle, secrets).await?;

    let exit = tokio::select! {
        exit = backend.wait(handle, timeout) => exit?,
        _ = cancel.cancelled() => return Err(WeirError::Cancelled),
    };
    let logs = backend.logs(handle).await.unwrap_or_default();

    if exit != 0 {
        return Err(WeirError::Permanent(format!(
            "agent exited with status {}: {}",
            exit,
            log_tail(&logs)
        )));
    }

    match tokio::fs::read(handle.workdir.join("output.json")).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(output) => Ok(output),
            Err(e) => {
                warn!(node_id = %handle.spec.node_id, error = %e, "Agent output is not valid JSON");
                Ok(json!({ "text": log_tail(&logs) }))
            }
        },
        Err(_) => Ok(json!({ "text": log_tail(&logs) })),
    }
}

fn log_tail(logs: &str) -> &str {
    let cut = logs.len().saturating_sub(LOG_TAIL_BYTES);
    if cut == 0 {
        return logs;
    }
    match logs.char_indices().find(|(i, _)| *i >= cut) {
        Some((i, _)) => &logs[i..],
        None => "",
    }
}
