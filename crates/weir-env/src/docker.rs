use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use tracing::{debug, warn};

use weir_core::config::EnvironmentConfig;
use weir_core::error::{Result, WeirError};
use weir_core::types::RunId;

use crate::{
    truncate_output, EnvHandle, EnvSpec, EnvState, EnvironmentBackend, LABEL_MANAGED,
    LABEL_NODE_ID, LABEL_RUN_ID,
};

/// Docker-backed environments via bollard. Containers are labeled with
/// their run id so the startup sweep can find leftovers from a crash.
pub struct DockerBackend {
    docker: bollard::Docker,
    config: EnvironmentConfig,
    workdir_root: PathBuf,
}

impl DockerBackend {
    pub fn new(config: EnvironmentConfig, workdir_root: PathBuf) -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| WeirError::Build(format!("Docker connect failed: {}", e)))?;
        Ok(Self {
            docker,
            config,
            workdir_root,
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.config.pull_images {
            return Err(WeirError::Build(format!("image not present: {}", image)));
        }
        debug!(image = %image, "Pulling image");
        let options = bollard::image::CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(item) = pull.next().await {
            item.map_err(|e| WeirError::Build(format!("image pull failed: {}", e)))?;
        }
        Ok(())
    }

    fn container_config(
        spec: &EnvSpec,
        workdir: &std::path::Path,
        secrets: &HashMap<String, String>,
    ) -> bollard::container::Config<String> {
        let env = env_pairs(spec, secrets);

        let mut binds = vec![format!("{}:/weir", workdir.display())];
        for m in &spec.mounts {
            let suffix = if m.read_only { ":ro" } else { "" };
            binds.push(format!("{}:{}{}", m.host.display(), m.container, suffix));
        }

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_RUN_ID.to_string(), spec.run_id.to_string());
        labels.insert(LABEL_NODE_ID.to_string(), spec.node_id.clone());

        let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> =
            HashMap::new();
        for p in &spec.ports {
            let key = format!("{}/tcp", p.container);
            exposed.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: p.host.map(|h| h.to_string()),
                }]),
            );
        }

        bollard::container::Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            user: spec.limits.run_as_user.clone(),
            labels: Some(labels),
            working_dir: Some("/weir".to_string()),
            exposed_ports: (!exposed.is_empty()).then_some(exposed),
            host_config: Some(bollard::models::HostConfig {
                memory: memory_bytes(spec.limits.memory_mb),
                nano_cpus: nano_cpus(spec.limits.cpus),
                binds: Some(binds),
                network_mode: Some(spec.limits.network_mode.clone()),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn env_pairs(spec: &EnvSpec, secrets: &HashMap<String, String>) -> Vec<String> {
    let mut env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.extend(secrets.iter().map(|(k, v)| format!("{}={}", k, v)));
    env.push(format!("WEIR_RUN_ID={}", spec.run_id));
    env.push(format!("WEIR_NODE_ID={}", spec.node_id));
    env.push("WEIR_INPUT=/weir/input.json".to_string());
    env.push("WEIR_OUTPUT=/weir/output.json".to_string());
    env
}

fn memory_bytes(memory_mb: u64) -> Option<i64> {
    (memory_mb > 0).then(|| (memory_mb as i64) * 1024 * 1024)
}

fn nano_cpus(cpus: f64) -> Option<i64> {
    (cpus > 0.0).then(|| (cpus * 1_000_000_000.0) as i64)
}

impl EnvironmentBackend for DockerBackend {
    fn build(&self, spec: EnvSpec) -> BoxFuture<'_, Result<EnvHandle>> {
        Box::pin(async move {
            self.ensure_image(&spec.image).await?;

            // Docker honors memory, cpu, network, and user limits; nothing
            // to degrade here.
            let handle = EnvHandle::new(spec, &self.workdir_root, Vec::new());
            tokio::fs::create_dir_all(&handle.workdir)
                .await
                .map_err(|e| WeirError::Build(format!("workdir create failed: {}", e)))?;
            debug!(env_id = %handle.id, image = %handle.spec.image, "Environment built");
            Ok(handle)
        })
    }

    fn start<'a>(
        &'a self,
        handle: &'a EnvHandle,
        secrets: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // Secrets enter the container config here and nowhere else;
            // the persisted EnvSpec never carries them.
            let config = Self::container_config(&handle.spec, &handle.workdir, &secrets);

            let deadline = Duration::from_secs(self.config.start_timeout_secs);
            let started = tokio::time::timeout(deadline, async {
                let container = self
                    .docker
                    .create_container::<&str, String>(None, config)
                    .await
                    .map_err(|e| WeirError::Start(format!("Docker create failed: {}", e)))?;
                handle.set_backend_ref(container.id.clone());
                self.docker
                    .start_container::<String>(&container.id, None)
                    .await
                    .map_err(|e| WeirError::Start(format!("Docker start failed: {}", e)))?;
                Ok::<_, WeirError>(())
            })
            .await;

            match started {
                Ok(Ok(())) => {
                    handle.set_state(EnvState::Running);
                    debug!(
                        env_id = %handle.id,
                        node_id = %handle.spec.node_id,
                        "Environment started"
                    );
                    Ok(())
                }
                Ok(Err(e)) => {
                    handle.set_state(EnvState::Failed);
                    Err(e)
                }
                Err(_) => {
                    handle.set_state(EnvState::Failed);
                    Err(WeirError::Start(format!(
                        "startup exceeded {}s",
                        self.config.start_timeout_secs
                    )))
                }
            }
        })
    }

    fn wait<'a>(&'a self, handle: &'a EnvHandle, timeout: Duration) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let container_id = handle.backend_ref().ok_or_else(|| {
                WeirError::InternalConsistency(
                    "wait called on an environment that never started".into(),
                )
            })?;

            let wait_result = tokio::time::timeout(timeout, async {
                let mut stream = self.docker.wait_container::<String>(
                    &container_id,
                    None::<bollard::container::WaitContainerOptions<String>>,
                );
                stream.next().await
            })
            .await;

            match wait_result {
                Ok(Some(Ok(exit))) => Ok(exit.status_code),
                // Non-zero exits surface as a wait error carrying the code
                Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError {
                    code, ..
                }))) => Ok(code),
                Ok(Some(Err(e))) => {
                    Err(WeirError::Transient(format!("Docker wait failed: {}", e)))
                }
                Ok(None) => Ok(0),
                Err(_) => {
                    // Timed out: kill now; stop still runs afterwards
                    self.docker
                        .kill_container::<String>(&container_id, None)
                        .await
                        .ok();
                    Err(WeirError::Timeout {
                        timeout_secs: timeout.as_secs(),
                    })
                }
            }
        })
    }

    fn logs<'a>(&'a self, handle: &'a EnvHandle) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let Some(container_id) = handle.backend_ref() else {
                return Ok(String::new());
            };
            let log_options = bollard::container::LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut log_stream = self.docker.logs(&container_id, Some(log_options));
            let mut output = String::new();
            while let Some(Ok(log)) = log_stream.next().await {
                output.push_str(&log.to_string());
            }
            Ok(truncate_output(output))
        })
    }

    fn health_check<'a>(&'a self, handle: &'a EnvHandle) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let Some(container_id) = handle.backend_ref() else {
                return Ok(false);
            };
            let inspect = self
                .docker
                .inspect_container(&container_id, None)
                .await
                .map_err(|e| WeirError::Transient(format!("Docker inspect failed: {}", e)))?;
            Ok(inspect.state.and_then(|s| s.running).unwrap_or(false))
        })
    }

    fn port_map<'a>(
        &'a self,
        handle: &'a EnvHandle,
    ) -> BoxFuture<'a, Result<HashMap<u16, u16>>> {
        Box::pin(async move {
            let Some(container_id) = handle.backend_ref() else {
                return Ok(HashMap::new());
            };
            let inspect = self
                .docker
                .inspect_container(&container_id, None)
                .await
                .map_err(|e| WeirError::Transient(format!("Docker inspect failed: {}", e)))?;

            let mut map = HashMap::new();
            let Some(ports) = inspect.network_settings.and_then(|n| n.ports) else {
                return Ok(map);
            };
            for (key, bindings) in ports {
                let container_port = match key.split('/').next().and_then(|p| p.parse().ok()) {
                    Some(p) => p,
                    None => continue,
                };
                let host_port = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|b| b.host_port.and_then(|p| p.parse().ok()))
                    .next();
                if let Some(host_port) = host_port {
                    map.insert(container_port, host_port);
                }
            }
            Ok(map)
        })
    }

    fn stop<'a>(&'a self, handle: &'a EnvHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(container_id) = handle.take_backend_ref() {
                let remove_options = bollard::container::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };
                if let Err(e) = self
                    .docker
                    .remove_container(&container_id, Some(remove_options))
                    .await
                {
                    warn!(env_id = %handle.id, error = %e, "Environment remove failed");
                }
            }
            tokio::fs::remove_dir_all(&handle.workdir).await.ok();
            handle.set_state(EnvState::Stopped);
            Ok(())
        })
    }

    fn sweep_orphans(&self, live: Vec<RunId>) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let live: HashSet<String> = live.into_iter().map(|r| r.0).collect();

            let mut filters = HashMap::new();
            filters.insert("label".to_string(), vec![format!("{}=true", LABEL_MANAGED)]);
            let options = bollard::container::ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            };
            let containers = self
                .docker
                .list_containers(Some(options))
                .await
                .map_err(|e| WeirError::Transient(format!("Docker list failed: {}", e)))?;

            let mut removed = 0;
            for summary in containers {
                let Some(id) = summary.id else { continue };
                let run_id = summary
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_RUN_ID))
                    .cloned();
                // No run label means it is not ours to keep
                let orphaned = run_id.map(|r| !live.contains(&r)).unwrap_or(true);
                if orphaned {
                    let remove_options = bollard::container::RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    };
                    if self
                        .docker
                        .remove_container(&id, Some(remove_options))
                        .await
                        .is_ok()
                    {
                        removed += 1;
                    }
                }
            }
            if removed > 0 {
                warn!(removed, "Swept orphaned environments");
            }
            Ok(removed)
        })
    }
}
