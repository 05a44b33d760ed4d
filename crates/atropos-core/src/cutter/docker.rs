//! Container-runtime cutter.
//!
//! Claims `docker_*` actions and drives the ambient Docker socket. Containers
//! belonging to a node carry the label `atropos.node=<name>`; when no
//! container is labelled for the target, the cut falls back to every running
//! container on the host.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{KillContainerOptions, ListContainersOptions};
use bollard::Docker;
use tokio::sync::OnceCell;
use tracing::info;

use super::{CutError, CutParams, Cutter};

/// Label that binds a container to a managed node.
const NODE_LABEL: &str = "atropos.node";

pub struct DockerCutter {
    /// Lazily initialised and retained for the process lifetime.
    client: OnceCell<Docker>,
}

impl DockerCutter {
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Docker, CutError> {
        self.client
            .get_or_try_init(|| async {
                Docker::connect_with_local_defaults()
                    .map_err(|e| CutError::Backend(format!("docker client: {e}")))
            })
            .await
    }
}

impl Default for DockerCutter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cutter for DockerCutter {
    fn name(&self) -> &str {
        "docker"
    }

    fn can_handle(&self, action: &str) -> bool {
        action.starts_with("docker_")
    }

    async fn execute(&self, target: &str, params: &CutParams) -> Result<(), CutError> {
        let action = params.get("action").map(String::as_str).unwrap_or_default();
        info!(target = %target, action = %action, op = "docker_cut", "container cut");

        let docker = self.client().await?;

        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{NODE_LABEL}={target}")],
        );
        let mut containers = docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| CutError::Backend(format!("list containers: {e}")))?;

        if containers.is_empty() {
            containers = docker
                .list_containers(Some(ListContainersOptions::<String> {
                    all: false,
                    ..Default::default()
                }))
                .await
                .map_err(|e| CutError::Backend(format!("list all containers: {e}")))?;
        }

        for container in &containers {
            let id = container.id.as_deref().unwrap_or_default();

            let op = match action {
                "docker_pause_all" => {
                    if container.state.as_deref() == Some("running") {
                        docker.pause_container(id).await
                    } else {
                        Ok(())
                    }
                }
                "docker_stop_all" => docker.stop_container(id, None).await,
                "docker_kill_all" => {
                    docker
                        .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
                        .await
                }
                other => {
                    return Err(CutError::Usage(format!("unsupported action: {other}")));
                }
            };

            // First failure aborts the batch.
            if let Err(e) = op {
                let short = &id[..id.len().min(12)];
                return Err(CutError::Backend(format!(
                    "{action} container {short}: {e}"
                )));
            }
        }

        Ok(())
    }
}
