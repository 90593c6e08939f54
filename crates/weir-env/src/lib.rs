//! Execution environments: isolated, ephemeral runtimes for one agent
//! invocation each. Two backends: docker (bollard) and a local process
//! fallback. An environment is destroyed unconditionally when the
//! invocation ends; the backend owns no durable state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use weir_core::config::EnvironmentConfig;
use weir_core::error::Result;
use weir_core::types::RunId;

pub mod docker;
pub mod process;

pub use docker::DockerBackend;
pub use process::ProcessBackend;

/// Container label marking environments managed by this engine.
pub const LABEL_MANAGED: &str = "weir.managed";
/// Container label carrying the owning run id, read by the orphan sweep.
pub const LABEL_RUN_ID: &str = "weir.run_id";
/// Container label carrying the symbolic node id.
pub const LABEL_NODE_ID: &str = "weir.node_id";

/// A host path mounted into the environment. Inputs only: mounts are
/// read-only unless a backend needs a writable scratch path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Container port exposed to the host. `host: None` picks an ephemeral port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortBinding {
    pub container: u16,
    pub host: Option<u16>,
}

/// Resource limits requested for one environment. A backend that cannot
/// honor a limit must report it as a degradation at build time, never
/// silently drop it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpus: f64,
    pub network_mode: String,
    pub run_as_user: Option<String>,
}

impl ResourceLimits {
    pub fn from_config(config: &EnvironmentConfig) -> Self {
        Self {
            memory_mb: config.memory_mb,
            cpus: config.cpus,
            network_mode: config.network_mode.clone(),
            run_as_user: config.run_as_user.clone(),
        }
    }
}

/// What to provision for one invocation. Never carries secret values:
/// secrets are injected at `start`, not baked into the build spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvSpec {
    pub run_id: RunId,
    pub node_id: String,
    pub image: String,
    pub command: Vec<String>,
    /// Plain, non-secret environment variables.
    pub env: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortBinding>,
    pub limits: ResourceLimits,
}

/// Lifecycle state of one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Building,
    Running,
    Stopped,
    Failed,
}

/// Handle to one provisioned environment. Runtime-only: handles are never
/// persisted, so a crash leaves the orphan sweep as the cleanup path.
#[derive(Debug)]
pub struct EnvHandle {
    pub id: String,
    pub spec: EnvSpec,
    /// Per-invocation scratch directory mounted into the environment.
    pub workdir: PathBuf,
    /// Limits the backend could not honor, reported instead of dropped.
    pub degradations: Vec<String>,
    state: Mutex<EnvState>,
    /// Backend-specific reference: container id or process id. Taken by
    /// `stop`, which makes teardown idempotent.
    backend_ref: Mutex<Option<String>>,
}

impl EnvHandle {
    pub fn new(spec: EnvSpec, workdir_root: &Path, degradations: Vec<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let workdir = workdir_root.join(&id);
        Self {
            id,
            spec,
            workdir,
            degradations,
            state: Mutex::new(EnvState::Building),
            backend_ref: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EnvState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: EnvState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn backend_ref(&self) -> Option<String> {
        self.backend_ref
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_backend_ref(&self, r: String) {
        *self.backend_ref.lock().unwrap_or_else(|e| e.into_inner()) = Some(r);
    }

    /// Remove and return the backend reference. Second and later calls see
    /// None, which is what makes `stop` safe to call repeatedly.
    pub fn take_backend_ref(&self) -> Option<String> {
        self.backend_ref
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// One isolated runtime per agent invocation.
///
/// Call order: `build` → `start` → `wait` → `logs` → `stop`. `stop` is
/// idempotent and must run exactly once per successful `build`, in deferred
/// fashion, regardless of how the invocation exits.
pub trait EnvironmentBackend: Send + Sync + 'static {
    /// Provision everything non-secret: verify the image, create the
    /// scratch directory, validate limits. Unsupported limits land in
    /// `EnvHandle::degradations`.
    fn build(&self, spec: EnvSpec) -> BoxFuture<'_, Result<EnvHandle>>;

    /// Inject secrets and launch, bounded by the configured start timeout
    /// (distinct from the invocation timeout).
    fn start<'a>(
        &'a self,
        handle: &'a EnvHandle,
        secrets: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Block until the environment exits, killing it when `timeout`
    /// elapses. Returns the exit code.
    fn wait<'a>(&'a self, handle: &'a EnvHandle, timeout: Duration) -> BoxFuture<'a, Result<i64>>;

    /// Combined stdout/stderr collected so far.
    fn logs<'a>(&'a self, handle: &'a EnvHandle) -> BoxFuture<'a, Result<String>>;

    fn health_check<'a>(&'a self, handle: &'a EnvHandle) -> BoxFuture<'a, Result<bool>>;

    /// Container-port to host-port mapping, empty when nothing is bound.
    fn port_map<'a>(&'a self, handle: &'a EnvHandle) -> BoxFuture<'a, Result<HashMap<u16, u16>>>;

    /// Tear down. Idempotent; safe on partially built handles.
    fn stop<'a>(&'a self, handle: &'a EnvHandle) -> BoxFuture<'a, Result<()>>;

    /// Remove environments whose run id is not in `live`. Returns how many
    /// were removed.
    fn sweep_orphans(&self, live: Vec<RunId>) -> BoxFuture<'_, Result<usize>>;
}

/// Logs and outputs are truncated past this many bytes.
pub const MAX_CAPTURE_BYTES: usize = 30_000;

pub(crate) fn truncate_output(mut output: String) -> String {
    if output.len() > MAX_CAPTURE_BYTES {
        output.truncate(MAX_CAPTURE_BYTES);
        output.push_str("\n... (output truncated)");
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> EnvSpec {
        EnvSpec {
            run_id: RunId::from_str("r-1"),
            node_id: "scan".into(),
            image: "alpine:3.20".into(),
            command: vec!["true".into()],
            env: HashMap::new(),
            mounts: vec![],
            ports: vec![],
            limits: ResourceLimits {
                memory_mb: 64,
                cpus: 0.5,
                network_mode: "none".into(),
                run_as_user: None,
            },
        }
    }

    #[test]
    fn test_handle_take_backend_ref_is_single_shot() {
        let handle = EnvHandle::new(sample_spec(), Path::new("/tmp/weir-test"), vec![]);
        assert_eq!(handle.workdir, PathBuf::from("/tmp/weir-test").join(&handle.id));
        handle.set_backend_ref("abc123".into());
        assert_eq!(handle.take_backend_ref().as_deref(), Some("abc123"));
        assert_eq!(handle.take_backend_ref(), None);
    }

    #[test]
    fn test_spec_serialization_has_no_secret_field() {
        let json = serde_json::to_value(sample_spec()).unwrap();
        assert!(json.get("secrets").is_none());
        assert!(json.get("env").is_some());
    }

    #[test]
    fn test_truncate_output() {
        let long = "x".repeat(MAX_CAPTURE_BYTES + 10);
        let out = truncate_output(long);
        assert!(out.ends_with("(output truncated)"));
        let short = truncate_output("ok".to_string());
        assert_eq!(short, "ok");
    }
}
