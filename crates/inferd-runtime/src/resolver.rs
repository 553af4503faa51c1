//! Topology-aware upstream address resolution.
//!
//! The proxy only knows an instance by its published host port. Whether that
//! port is reachable on loopback or only through the overlay network depends
//! on where this process runs, so resolution is a strategy:
//!
//! - flat mode (no overlay network configured): loopback, an identity
//!   function of configuration;
//! - overlay mode: find the container publishing the port on the configured
//!   network and use its network-internal address, cached per host port.
//!
//! Resolution never fails. Availability beats address precision here: any
//! lookup problem degrades to a well-known gateway hostname.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::gateway::ContainerRuntime;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Overlay network name. None selects flat/local mode.
    pub overlay_network: Option<String>,
    /// Hostname used when overlay resolution fails (e.g.
    /// "host.docker.internal").
    pub fallback_host: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            overlay_network: None,
            fallback_host: "host.docker.internal".to_string(),
        }
    }
}

pub struct UpstreamResolver {
    runtime: Arc<dyn ContainerRuntime>,
    config: ResolverConfig,
    /// host port -> "ip:port" authority. Entries are immutable once written;
    /// last writer wins without further coordination.
    cache: DashMap<u16, String>,
}

impl UpstreamResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ResolverConfig) -> Self {
        Self {
            runtime,
            config,
            cache: DashMap::new(),
        }
    }

    /// Resolve a published host port to a concrete upstream URL.
    pub async fn resolve(&self, host_port: u16, path: &str) -> String {
        let authority = self.resolve_authority(host_port).await;
        format!("http://{}{}", authority, path)
    }

    async fn resolve_authority(&self, host_port: u16) -> String {
        let Some(network) = self.config.overlay_network.clone() else {
            return format!("127.0.0.1:{}", host_port);
        };

        if let Some(cached) = self.cache.get(&host_port) {
            return cached.clone();
        }

        match self.lookup_on_network(&network, host_port).await {
            Some(authority) => {
                debug!(%host_port, %authority, "resolved upstream via overlay network");
                self.cache.insert(host_port, authority.clone());
                authority
            }
            None => {
                // Not cached, so a later call can still resolve precisely.
                warn!(
                    %host_port,
                    fallback = %self.config.fallback_host,
                    "overlay resolution failed, using fallback host"
                );
                format!("{}:{}", self.config.fallback_host, host_port)
            }
        }
    }

    async fn lookup_on_network(&self, network: &str, host_port: u16) -> Option<String> {
        let containers = match self.runtime.containers_on_network(network).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(%network, error = %e, "network query failed");
                return None;
            }
        };

        let matched = containers
            .into_iter()
            .find(|c| c.private_port_for(host_port).is_some())?;
        if matched.ip_address.is_empty() {
            return None;
        }
        // Inside the overlay the workload answers on its container-side
        // port; the published host port only exists at the host edge.
        let private_port = matched.private_port_for(host_port)?;
        Some(format!("{}:{}", matched.ip_address, private_port))
    }

    /// Drop a cached mapping. Host ports can be reused across container
    /// generations; callers that stop an instance may invalidate its port.
    pub fn invalidate(&self, host_port: u16) {
        self.cache.remove(&host_port);
    }

    #[cfg(test)]
    pub(crate) fn cached(&self, host_port: u16) -> Option<String> {
        self.cache.get(&host_port).map(|v| v.clone())
    }
}
