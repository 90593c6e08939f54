use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use weir_core::config::EnvironmentConfig;
use weir_core::error::{Result, WeirError};
use weir_core::types::RunId;

use crate::{truncate_output, EnvHandle, EnvSpec, EnvState, EnvironmentBackend};

/// Marker written into each workdir so the startup sweep can tell which
/// run a leftover directory belonged to.
const SPEC_MARKER: &str = ".envspec.json";

/// Runs agent commands as plain host processes. Isolation options that
/// only a container can honor are reported as degradations instead of
/// being silently dropped.
pub struct ProcessBackend {
    config: EnvironmentConfig,
    workdir_root: PathBuf,
    children: Mutex<HashMap<String, Child>>,
    captured: Mutex<HashMap<String, String>>,
}

impl ProcessBackend {
    pub fn new(config: EnvironmentConfig, workdir_root: PathBuf) -> Self {
        Self {
            config,
            workdir_root,
            children: Mutex::new(HashMap::new()),
            captured: Mutex::new(HashMap::new()),
        }
    }

    fn degradations(&self, spec: &EnvSpec) -> Vec<String> {
        let mut degraded = Vec::new();
        if spec.limits.memory_mb > 0 {
            degraded.push("memory limit not enforced for host processes".to_string());
        }
        if spec.limits.cpus > 0.0 {
            degraded.push("cpu limit not enforced for host processes".to_string());
        }
        if spec.limits.network_mode == "none" {
            degraded.push("network isolation not available for host processes".to_string());
        }
        if spec.limits.run_as_user.is_some() {
            degraded.push("user switching not available for host processes".to_string());
        }
        if !spec.ports.is_empty() {
            degraded.push("port mapping skipped; processes share the host network".to_string());
        }
        if !spec.mounts.is_empty() {
            degraded.push("mounts skipped; host paths are reachable directly".to_string());
        }
        if spec.image != self.config.default_image {
            degraded.push(format!("image {} ignored; command runs on the host", spec.image));
        }
        degraded
    }

    fn take_child(&self, id: &str) -> Option<Child> {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }
}

impl EnvironmentBackend for ProcessBackend {
    fn build(&self, spec: EnvSpec) -> BoxFuture<'_, Result<EnvHandle>> {
        Box::pin(async move {
            if spec.command.is_empty() {
                return Err(WeirError::Build("empty command".into()));
            }
            let degradations = self.degradations(&spec);
            let handle = EnvHandle::new(spec, &self.workdir_root, degradations);
            tokio::fs::create_dir_all(&handle.workdir)
                .await
                .map_err(|e| WeirError::Build(format!("workdir create failed: {}", e)))?;

            let marker = serde_json::to_vec(&handle.spec)?;
            tokio::fs::write(handle.workdir.join(SPEC_MARKER), marker)
                .await
                .map_err(|e| WeirError::Build(format!("marker write failed: {}", e)))?;

            debug!(env_id = %handle.id, node_id = %handle.spec.node_id, "Environment built");
            Ok(handle)
        })
    }

    fn start<'a>(
        &'a self,
        handle: &'a EnvHandle,
        secrets: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let spec = &handle.spec;
            let mut cmd = Command::new(&spec.command[0]);
            cmd.args(&spec.command[1..])
                .current_dir(&handle.workdir)
                .envs(&spec.env)
                .envs(&secrets)
                .env("WEIR_RUN_ID", spec.run_id.to_string())
                .env("WEIR_NODE_ID", &spec.node_id)
                .env("WEIR_INPUT", handle.workdir.join("input.json"))
                .env("WEIR_OUTPUT", handle.workdir.join("output.json"))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let child = cmd.spawn().map_err(|e| {
                handle.set_state(EnvState::Failed);
                WeirError::Start(format!("spawn failed: {}", e))
            })?;

            if let Some(pid) = child.id() {
                handle.set_backend_ref(pid.to_string());
            }
            self.children
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(handle.id.clone(), child);
            handle.set_state(EnvState::Running);
            debug!(env_id = %handle.id, node_id = %spec.node_id, "Environment started");
            Ok(())
        })
    }

    fn wait<'a>(&'a self, handle: &'a EnvHandle, timeout: Duration) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let child = self.take_child(&handle.id).ok_or_else(|| {
                WeirError::InternalConsistency(
                    "wait called on an environment that never started".into(),
                )
            })?;

            // Dropping the wait future on timeout drops the child, and
            // kill_on_drop takes it down with it.
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => {
                    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                    let combined = if stderr.is_empty() {
                        stdout
                    } else if stdout.is_empty() {
                        stderr
                    } else {
                        format!("{}\nSTDERR:\n{}", stdout, stderr)
                    };
                    self.captured
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(handle.id.clone(), truncate_output(combined));
                    Ok(output.status.code().unwrap_or(-1) as i64)
                }
                Ok(Err(e)) => Err(WeirError::Transient(format!("process wait failed: {}", e))),
                Err(_) => Err(WeirError::Timeout {
                    timeout_secs: timeout.as_secs(),
                }),
            }
        })
    }

    fn logs<'a>(&'a self, handle: &'a EnvHandle) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            Ok(self
                .captured
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&handle.id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn health_check<'a>(&'a self, handle: &'a EnvHandle) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(matches!(handle.state(), EnvState::Running)) })
    }

    fn port_map<'a>(
        &'a self,
        handle: &'a EnvHandle,
    ) -> BoxFuture<'a, Result<HashMap<u16, u16>>> {
        // Processes bind host ports directly; container ports map 1:1.
        Box::pin(async move {
            Ok(handle
                .spec
                .ports
                .iter()
                .map(|p| (p.container, p.host.unwrap_or(p.container)))
                .collect())
        })
    }

    fn stop<'a>(&'a self, handle: &'a EnvHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            handle.take_backend_ref();
            if let Some(mut child) = self.take_child(&handle.id) {
                child.start_kill().ok();
                child.wait().await.ok();
            }
            self.captured
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&handle.id);
            tokio::fs::remove_dir_all(&handle.workdir).await.ok();
            handle.set_state(EnvState::Stopped);
            Ok(())
        })
    }

    fn sweep_orphans(&self, live: Vec<RunId>) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let live: HashSet<String> = live.into_iter().map(|r| r.0).collect();
            let mut entries = match tokio::fs::read_dir(&self.workdir_root).await {
                Ok(entries) => entries,
                Err(_) => return Ok(0),
            };

            let mut removed = 0;
            while let Ok(Some(entry)) = entries.next_entry().await {
                let id = entry.file_name().to_string_lossy().to_string();
                let active = self
                    .children
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains_key(&id);
                if active {
                    continue;
                }
                let keep = match tokio::fs::read(entry.path().join(SPEC_MARKER)).await {
                    Ok(bytes) => serde_json::from_slice::<EnvSpec>(&bytes)
                        .map(|spec| live.contains(&spec.run_id.0))
                        .unwrap_or(false),
                    Err(_) => false,
                };
                if !keep && tokio::fs::remove_dir_all(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
            if removed > 0 {
                warn!(removed, "Swept orphaned environment workdirs");
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceLimits;

    fn backend(root: &std::path::Path) -> ProcessBackend {
        ProcessBackend::new(EnvironmentConfig::default(), root.to_path_buf())
    }

    fn spec_for(run_id: &str, command: Vec<&str>) -> EnvSpec {
        EnvSpec {
            run_id: RunId::from_str(run_id),
            node_id: "step".into(),
            image: EnvironmentConfig::default().default_image,
            command: command.into_iter().map(String::from).collect(),
            env: HashMap::new(),
            mounts: vec![],
            ports: vec![],
            limits: ResourceLimits {
                memory_mb: 0,
                cpus: 0.0,
                network_mode: "host".into(),
                run_as_user: None,
            },
        }
    }

    #[tokio::test]
    async fn test_run_and_capture_output() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let spec = spec_for("r-ok", vec!["sh", "-c", "echo hello; echo oops >&2"]);

        let handle = backend.build(spec).await.unwrap();
        backend.start(&handle, HashMap::new()).await.unwrap();
        let code = backend.wait(&handle, Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, 0);

        let logs = backend.logs(&handle).await.unwrap();
        assert!(logs.contains("hello"));
        assert!(logs.contains("oops"));
        backend.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_weir_env_vars_are_set() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let spec = spec_for("r-env", vec!["sh", "-c", "printf '%s' \"$WEIR_NODE_ID\""]);

        let handle = backend.build(spec).await.unwrap();
        backend.start(&handle, HashMap::new()).await.unwrap();
        backend.wait(&handle, Duration::from_secs(5)).await.unwrap();
        assert_eq!(backend.logs(&handle).await.unwrap(), "step");
        backend.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_secrets_reach_process_but_not_marker() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let spec = spec_for("r-sec", vec!["sh", "-c", "printf '%s' \"$API_KEY\""]);

        let handle = backend.build(spec).await.unwrap();
        let marker = std::fs::read_to_string(handle.workdir.join(SPEC_MARKER)).unwrap();
        assert!(!marker.contains("hunter2"));

        let secrets = HashMap::from([("API_KEY".to_string(), "hunter2".to_string())]);
        backend.start(&handle, secrets).await.unwrap();
        backend.wait(&handle, Duration::from_secs(5)).await.unwrap();
        assert_eq!(backend.logs(&handle).await.unwrap(), "hunter2");
        backend.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let spec = spec_for("r-slow", vec!["sleep", "30"]);

        let handle = backend.build(spec).await.unwrap();
        backend.start(&handle, HashMap::new()).await.unwrap();
        let err = backend
            .wait(&handle, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, WeirError::Timeout { .. }));
        backend.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let spec = spec_for("r-stop", vec!["sleep", "30"]);

        let handle = backend.build(spec).await.unwrap();
        backend.start(&handle, HashMap::new()).await.unwrap();
        backend.stop(&handle).await.unwrap();
        backend.stop(&handle).await.unwrap();
        assert!(!handle.workdir.exists());
        assert!(matches!(handle.state(), EnvState::Stopped));
    }

    #[tokio::test]
    async fn test_degradations_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let mut spec = spec_for("r-deg", vec!["true"]);
        spec.limits = ResourceLimits {
            memory_mb: 512,
            cpus: 1.0,
            network_mode: "none".into(),
            run_as_user: Some("1000".into()),
        };

        let handle = backend.build(spec).await.unwrap();
        assert_eq!(handle.degradations.len(), 4);
        assert!(handle.degradations.iter().any(|d| d.contains("memory")));
        assert!(handle.degradations.iter().any(|d| d.contains("network")));
        backend.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_runs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let live = backend.build(spec_for("r-live", vec!["true"])).await.unwrap();
        let dead = backend.build(spec_for("r-dead", vec!["true"])).await.unwrap();

        let removed = backend
            .sweep_orphans(vec![RunId::from_str("r-live")])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(live.workdir.exists());
        assert!(!dead.workdir.exists());
    }
}
