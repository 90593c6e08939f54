//! Agent invocation: resolves what a node actually runs and drives one
//! attempt bundle to a terminal outcome.
//!
//! The invoker owns retries. A node-level failure reaches the run state
//! machine only after timeouts and transient errors have exhausted their
//! budget; permanent failures and approval rejections pass through at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weir_core::config::{AppConfig, IntegrationConfig, RetryConfig};
use weir_core::error::{Result, WeirError};
use weir_core::traits::AgentRegistry;
use weir_core::types::{AgentKind, AgentSpec, Run, RunId, WorkflowNode};
use weir_env::{EnvSpec, EnvironmentBackend, ResourceLimits};

pub mod registry;
pub mod retry;
pub mod template;

mod http;
mod llm;
mod script;

pub use registry::ConfigAgentRegistry;

/// Result of a successful attempt bundle.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub output: Value,
    /// How many attempts it took, 1-based.
    pub attempts: u32,
}

/// What an agent receives, independent of execution kind.
#[derive(Serialize)]
struct InvocationPayload<'a> {
    action: &'a str,
    input: &'a Value,
    run_id: &'a RunId,
    node_id: &'a str,
}

pub struct Invoker {
    backend: Arc<dyn EnvironmentBackend>,
    registry: Arc<dyn AgentRegistry>,
    http: reqwest::Client,
    retry: RetryConfig,
    default_timeout_secs: u64,
    limits: ResourceLimits,
    integrations: HashMap<String, IntegrationConfig>,
    // Lazily created, one per integration key
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Invoker {
    pub fn new(
        config: &AppConfig,
        backend: Arc<dyn EnvironmentBackend>,
        registry: Arc<dyn AgentRegistry>,
    ) -> Self {
        Self {
            backend,
            registry,
            http: reqwest::Client::new(),
            retry: config.retry.clone(),
            default_timeout_secs: config.engine.default_node_timeout_secs,
            limits: ResourceLimits::from_config(&config.environment),
            integrations: config.integrations.clone(),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Run one node to a terminal outcome, retrying timeouts and transient
    /// failures with exponentially increasing, jittered backoff.
    pub async fn invoke(
        &self,
        run: &Run,
        node: &WorkflowNode,
        resolved_input: &Value,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome> {
        let agent = self.registry.get(&node.agent).await?;
        let _permit = self
            .semaphore(agent.integration_key())
            .acquire_owned()
            .await
            .map_err(|_| WeirError::InternalConsistency("integration semaphore closed".into()))?;

        let timeout = self.timeout_for(&agent);
        let max_retries = self.retry.max_retries;
        let mut attempt = 0;
        loop {
            debug!(
                run_id = %run.id,
                node_id = %node.id,
                agent = %agent.name,
                attempt = attempt + 1,
                "Invoking agent"
            );
            match self
                .invoke_once(run, node, &agent, resolved_input, timeout, cancel)
                .await
            {
                Ok(output) => {
                    return Ok(NodeOutcome {
                        output,
                        attempts: attempt + 1,
                    })
                }
                Err(e) => {
                    if e.is_retryable() && attempt < max_retries && !cancel.is_cancelled() {
                        let backoff = retry::calculate_backoff(attempt, &self.retry);
                        warn!(
                            run_id = %run.id,
                            node_id = %node.id,
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying agent invocation"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => return Err(WeirError::Cancelled),
                        }
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn invoke_once(
        &self,
        run: &Run,
        node: &WorkflowNode,
        agent: &AgentSpec,
        resolved_input: &Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let payload = serde_json::to_value(InvocationPayload {
            action: &node.action,
            input: resolved_input,
            run_id: &run.id,
            node_id: &node.id,
        })?;

        match &agent.kind {
            AgentKind::Script {
                image,
                command,
                env,
                secrets,
            } => {
                let spec = EnvSpec {
                    run_id: run.id.clone(),
                    node_id: node.id.clone(),
                    image: image.clone(),
                    command: command.clone(),
                    env: env.clone(),
                    mounts: vec![],
                    ports: vec![],
                    limits: self.limits.clone(),
                };
                script::run(
                    self.backend.as_ref(),
                    spec,
                    &payload,
                    secrets.clone(),
                    timeout,
                    cancel,
                )
                .await
            }
            AgentKind::Http {
                url,
                method,
                headers,
                bearer_token,
            } => {
                http::run(
                    &self.http,
                    url,
                    method,
                    headers,
                    bearer_token.as_deref(),
                    &payload,
                    timeout,
                    cancel,
                )
                .await
            }
            AgentKind::Llm {
                model,
                api_key,
                base_url,
                max_tokens,
            } => {
                llm::run(
                    &self.http,
                    model,
                    api_key.as_deref(),
                    base_url.as_deref(),
                    *max_tokens,
                    resolved_input,
                    timeout,
                    cancel,
                )
                .await
            }
        }
    }

    fn timeout_for(&self, agent: &AgentSpec) -> Duration {
        let secs = if agent.timeout_secs > 0 {
            agent.timeout_secs
        } else {
            self.default_timeout_secs
        };
        Duration::from_secs(secs)
    }

    fn semaphore(&self, key: &str) -> Arc<Semaphore> {
        let mut map = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| {
                let permits = self
                    .integrations
                    .get(key)
                    .map(|c| c.max_concurrent)
                    .unwrap_or_else(|| IntegrationConfig::default().max_concurrent);
                Arc::new(Semaphore::new(permits))
            })
            .clone()
    }
}
