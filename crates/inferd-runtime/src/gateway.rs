//! Thin adapter over the Docker API.
//!
//! Everything the orchestration core needs from a container runtime goes
//! through the [`ContainerRuntime`] trait so the reaper, provisioner and
//! resolver can be exercised against [`crate::test_utils::MockRuntime`].

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::{Result, RuntimeError};

/// What to run: image, name, port publishing and resource ceilings.
///
/// Memory and CPU values are hard limits handed to the runtime, not
/// advisory — enforcement (typically an OOM kill) is the runtime's job.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<String>,
    /// Port the workload listens on inside the container. Published to a
    /// daemon-assigned random host port.
    pub internal_port: u16,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    /// Pre-formatted bind string ("volume:/path:ro").
    pub volume_bind: Option<String>,
    /// Overlay network to attach to, when one is configured.
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

/// A container as seen on an overlay network: its address there and its
/// port mappings.
#[derive(Debug, Clone)]
pub struct NetworkContainer {
    pub name: String,
    pub ip_address: String,
    pub ports: Vec<PortPair>,
}

/// One container port and the host port it is published on, if any.
#[derive(Debug, Clone, Copy)]
pub struct PortPair {
    pub private_port: u16,
    pub public_port: Option<u16>,
}

impl NetworkContainer {
    /// The container-side port backing a published host port.
    pub fn private_port_for(&self, host_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.public_port == Some(host_port))
            .map(|p| p.private_port)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<()>;
    async fn image_present(&self, image: &str) -> bool;
    async fn create_container(&self, spec: &WorkloadSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    /// Stop a container. "Already stopped" and "no such container" are
    /// success: stopping twice is indistinguishable from stopping once.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;
    /// Host port bound to `internal_port`, if the runtime reports one.
    async fn host_port(&self, id: &str, internal_port: u16) -> Result<Option<u16>>;
    async fn is_running(&self, id: &str) -> Result<bool>;
    async fn containers_on_network(&self, network: &str) -> Result<Vec<NetworkContainer>>;
}

/// Docker-backed runtime via bollard.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it answers a ping.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        info!("Connected to Docker daemon");
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    pub fn with_client(docker: Arc<Docker>) -> Self {
        Self { docker }
    }
}

fn tcp_key(port: u16) -> String {
    format!("{}/tcp", port)
}

/// "Already in desired state" answers from the daemon count as success.
fn is_benign_stop_error(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304 | 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self), fields(image = %image))]
    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(%image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(%status, "pull progress");
                    }
                }
                // Only an explicit stream error is a failed pull; a stream
                // that simply ends is completion.
                Err(e) => {
                    return Err(RuntimeError::PullFailed {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(%image, "image pulled");
        Ok(())
    }

    async fn image_present(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &WorkloadSpec) -> Result<String> {
        let key = tcp_key(spec.internal_port);

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        // host_port None asks the daemon for a random free port.
        port_bindings.insert(
            key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None,
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(key, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            memory: Some((spec.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((spec.cpu_cores * 1_000_000_000.0) as i64),
            binds: spec.volume_bind.clone().map(|b| vec![b]),
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            exposed_ports: Some(exposed_ports),
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone())
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(RuntimeError::CreationFailed)?;

        info!(container_id = %created.id, "container created");
        Ok(created.id)
    }

    #[instrument(skip(self))]
    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(RuntimeError::StartFailed)?;
        info!(container_id = %id, "container started");
        Ok(())
    }

    #[instrument(skip(self), fields(timeout_s = timeout.as_secs()))]
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => {
                info!(container_id = %id, "container stopped");
                Ok(())
            }
            Err(e) if is_benign_stop_error(&e) => {
                debug!(container_id = %id, "container already stopped");
                Ok(())
            }
            Err(e) => Err(RuntimeError::StopFailed(e)),
        }
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = %id, "container already removed");
                Ok(())
            }
            Err(e) => Err(RuntimeError::RemovalFailed(e)),
        }
    }

    async fn host_port(&self, id: &str, internal_port: u16) -> Result<Option<u16>> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(RuntimeError::InspectFailed)?;

        let port = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(&tcp_key(internal_port)).cloned().flatten())
            .and_then(|bindings| {
                bindings
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))
            });
        Ok(port)
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(RuntimeError::InspectFailed)?;
        Ok(inspect
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }

    #[instrument(skip(self))]
    async fn containers_on_network(&self, network: &str) -> Result<Vec<NetworkContainer>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("network".to_string(), vec![network.to_string()]);

        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let summaries = self.docker.list_containers(Some(options)).await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let name = summary
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();

            let ip_address = summary
                .network_settings
                .as_ref()
                .and_then(|ns| ns.networks.as_ref())
                .and_then(|nets| nets.get(network))
                .and_then(|ep| ep.ip_address.clone())
                .unwrap_or_default();

            let ports = summary
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| PortPair {
                    private_port: p.private_port as u16,
                    public_port: p.public_port.map(|p| p as u16),
                })
                .collect();

            if ip_address.is_empty() {
                warn!(container = %name, %network, "container has no address on network");
            }

            containers.push(NetworkContainer {
                name,
                ip_address,
                ports,
            });
        }
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_key() {
        assert_eq!(tcp_key(11434), "11434/tcp");
    }

    #[test]
    fn test_benign_stop_errors() {
        let already_stopped = BollardError::DockerResponseServerError {
            status_code: 304,
            message: "container already stopped".to_string(),
        };
        let gone = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        let server_error = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "daemon error".to_string(),
        };
        assert!(is_benign_stop_error(&already_stopped));
        assert!(is_benign_stop_error(&gone));
        assert!(!is_benign_stop_error(&server_error));
    }
}
