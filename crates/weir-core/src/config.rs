use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeirError};
use crate::types::AgentSpec;

/// Top-level Weir configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Agent capability registry entries, keyed by agent reference.
    #[serde(default)]
    pub agents: HashMap<String, AgentSpec>,
    /// Per-integration concurrency limits, keyed by integration name.
    #[serde(default)]
    pub integrations: HashMap<String, IntegrationConfig>,
}

/// Orchestration engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing nodes per run.
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
    /// Invocation timeout applied when the agent spec does not set one.
    #[serde(default = "default_node_timeout")]
    pub default_node_timeout_secs: u64,
    /// Approval gate deadline. 0 disables the deadline entirely.
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
    /// Longest permitted auto-trigger chain (run completion triggering
    /// another workflow). Deeper triggers are refused.
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel_nodes(),
            default_node_timeout_secs: default_node_timeout(),
            approval_timeout_secs: default_approval_timeout(),
            max_chain_depth: default_max_chain_depth(),
        }
    }
}

fn default_max_parallel_nodes() -> usize {
    4
}
fn default_node_timeout() -> u64 {
    300
}
fn default_approval_timeout() -> u64 {
    86_400
}
fn default_max_chain_depth() -> u32 {
    8
}

/// Retry policy for retryable invocation failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30_000
}

/// Which runtime backs execution environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvBackendKind {
    #[default]
    Docker,
    /// Local process fallback for development. Cannot enforce memory, cpu,
    /// or network limits; each one is reported as a degradation.
    Process,
}

/// Execution environment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub backend: EnvBackendKind,
    #[serde(default = "default_image")]
    pub default_image: String,
    /// Root for per-invocation mount directories.
    #[serde(default = "default_env_workdir")]
    pub workdir: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Docker network mode. Isolated by default.
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    /// Container user, e.g. "1000:1000". None keeps the image default.
    #[serde(default)]
    pub run_as_user: Option<String>,
    /// Startup deadline, distinct from the invocation timeout.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    /// Pull missing images on build instead of failing.
    #[serde(default)]
    pub pull_images: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            backend: EnvBackendKind::default(),
            default_image: default_image(),
            workdir: default_env_workdir(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
            network_mode: default_network_mode(),
            run_as_user: None,
            start_timeout_secs: default_start_timeout(),
            pull_images: false,
        }
    }
}

fn default_image() -> String {
    "alpine:3.20".to_string()
}
fn default_env_workdir() -> String {
    "~/.weir/envs".to_string()
}
fn default_memory_mb() -> u64 {
    512
}
fn default_cpus() -> f64 {
    1.0
}
fn default_network_mode() -> String {
    "none".to_string()
}
fn default_start_timeout() -> u64 {
    60
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.weir/weir.db".to_string()
}

/// Operator HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on every route except health. None disables
    /// auth (development only).
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8790".to_string()
}

/// Per-run JSONL event log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for per-run log files. Default: <workdir sibling> "logs".
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

fn default_log_enabled() -> bool {
    true
}

/// Concurrency bound for one external integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeirError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let mut config: AppConfig =
            toml::from_str(&expanded).map_err(|e| WeirError::Config(e.to_string()))?;

        // Map-keyed agents get their name from the key
        for (name, spec) in config.agents.iter_mut() {
            if spec.name.is_empty() {
                spec.name = name.clone();
            }
        }

        Ok(config)
    }

    /// Search chain: explicit path, ./weir.toml, ~/.weir/weir.toml.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let local = PathBuf::from("weir.toml");
        if local.exists() {
            return Self::load(&local);
        }
        if let Some(home) = dirs_home() {
            let global = home.join(".weir").join("weir.toml");
            if global.exists() {
                return Self::load(&global);
            }
        }
        Err(WeirError::ConfigNotFound(
            "weir.toml (./ or ~/.weir/)".to_string(),
        ))
    }

    /// Environment workdir with ~ expanded.
    pub fn env_workdir(&self) -> PathBuf {
        expand_home(&self.environment.workdir)
    }

    /// Database path with ~ expanded.
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Run-log directory with ~ expanded. Defaults next to the database.
    pub fn log_dir(&self) -> PathBuf {
        match &self.log.dir {
            Some(dir) => expand_home(dir),
            None => {
                let mut path = self.db_path();
                path.pop();
                path.join("logs")
            }
        }
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
