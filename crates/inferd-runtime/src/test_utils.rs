//! In-memory [`ContainerRuntime`] for tests.
//!
//! Behavior is scripted per scenario: which host port the daemon "assigns",
//! which calls fail, what sits on the overlay network. Call counts are
//! recorded so tests can assert how components drove the runtime.

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::gateway::{ContainerRuntime, NetworkContainer, PortPair, WorkloadSpec};
use crate::{Result, RuntimeError};

#[derive(Debug, Clone)]
pub struct CreatedContainer {
    pub id: String,
    pub spec_name: String,
    pub image: String,
    pub running: bool,
    pub stop_calls: u32,
}

#[derive(Default)]
struct Inner {
    created: Vec<CreatedContainer>,
    next_id: u32,
    next_host_port: u16,
    suppress_host_port: bool,
    present_images: Vec<String>,
    fail_pull: bool,
    fail_start: bool,
    fail_stop_ids: Vec<String>,
    networks: HashMap<String, Vec<NetworkContainer>>,
    fail_network_queries: bool,
    network_query_count: u32,
}

pub struct MockRuntime {
    inner: Mutex<Inner>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_host_port: 32768,
                ..Default::default()
            }),
        }
    }

    pub fn mark_image_present(&self, image: &str) {
        self.inner.lock().unwrap().present_images.push(image.to_string());
    }

    pub fn fail_pull(&self) {
        self.inner.lock().unwrap().fail_pull = true;
    }

    pub fn fail_start(&self) {
        self.inner.lock().unwrap().fail_start = true;
    }

    /// Make the next created container come up without a bound host port.
    pub fn suppress_host_port(&self) {
        self.inner.lock().unwrap().suppress_host_port = true;
    }

    /// Pin the host port the daemon "assigns" next.
    pub fn set_next_host_port(&self, port: u16) {
        self.inner.lock().unwrap().next_host_port = port;
    }

    pub fn fail_stop_for(&self, id: &str) {
        self.inner.lock().unwrap().fail_stop_ids.push(id.to_string());
    }

    pub fn add_network_container(
        &self,
        network: &str,
        name: &str,
        ip: &str,
        ports: &[(u16, u16)],
    ) {
        let container = NetworkContainer {
            name: name.to_string(),
            ip_address: ip.to_string(),
            ports: ports
                .iter()
                .map(|&(private_port, public_port)| PortPair {
                    private_port,
                    public_port: Some(public_port),
                })
                .collect(),
        };
        self.inner
            .lock()
            .unwrap()
            .networks
            .entry(network.to_string())
            .or_default()
            .push(container);
    }

    pub fn fail_network_queries(&self) {
        self.inner.lock().unwrap().fail_network_queries = true;
    }

    pub fn network_query_count(&self) -> u32 {
        self.inner.lock().unwrap().network_query_count
    }

    pub fn created_containers(&self) -> Vec<CreatedContainer> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn stop_calls(&self, id: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .created
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.stop_calls)
            .unwrap_or(0)
    }

    /// Register a container the mock should consider pre-existing, e.g. one
    /// the tracker already knows about.
    pub fn register_container(&self, id: &str, running: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.created.push(CreatedContainer {
            id: id.to_string(),
            spec_name: id.to_string(),
            image: String::new(),
            running,
            stop_calls: 0,
        });
    }

    fn server_error(message: &str) -> BollardError {
        BollardError::DockerResponseServerError {
            status_code: 500,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_pull {
            return Err(RuntimeError::PullFailed {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        inner.present_images.push(image.to_string());
        Ok(())
    }

    async fn image_present(&self, image: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .present_images
            .iter()
            .any(|i| i == image)
    }

    async fn create_container(&self, spec: &WorkloadSpec) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("mock-container-{}", inner.next_id);
        inner.created.push(CreatedContainer {
            id: id.clone(),
            spec_name: spec.name.clone(),
            image: spec.image.clone(),
            running: false,
            stop_calls: 0,
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_start {
            return Err(RuntimeError::StartFailed(Self::server_error(
                "cannot start container",
            )));
        }
        if let Some(c) = inner.created.iter_mut().find(|c| c.id == id) {
            c.running = true;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_stop_ids.iter().any(|i| i == id) {
            return Err(RuntimeError::StopFailed(Self::server_error(
                "daemon unavailable",
            )));
        }
        // Stopping an unknown or already-stopped container is success, same
        // as the Docker gateway's 304/404 handling.
        if let Some(c) = inner.created.iter_mut().find(|c| c.id == id) {
            c.running = false;
            c.stop_calls += 1;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.created.retain(|c| c.id != id);
        Ok(())
    }

    async fn host_port(&self, _id: &str, _internal_port: u16) -> Result<Option<u16>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.suppress_host_port {
            return Ok(None);
        }
        let port = inner.next_host_port;
        inner.next_host_port += 1;
        Ok(Some(port))
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .created
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.running)
            .unwrap_or(false))
    }

    async fn containers_on_network(&self, network: &str) -> Result<Vec<NetworkContainer>> {
        let mut inner = self.inner.lock().unwrap();
        inner.network_query_count += 1;
        if inner.fail_network_queries {
            return Err(RuntimeError::DockerApi(Self::server_error(
                "network not found",
            )));
        }
        Ok(inner.networks.get(network).cloned().unwrap_or_default())
    }
}
