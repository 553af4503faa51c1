//! Environment-driven server configuration.

use inferd_common::InferdError;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Overlay network the gateway and workloads share. None means the
    /// gateway reaches workloads over loopback.
    pub overlay_network: Option<String>,
    /// Upstream host used when overlay resolution fails.
    pub fallback_host: String,
    pub reaper_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            overlay_network: None,
            fallback_host: "host.docker.internal".to_string(),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, InferdError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("INFERD_BIND_ADDR") {
            config.bind_addr = addr.parse().map_err(|_| {
                InferdError::Config(format!("invalid INFERD_BIND_ADDR: {}", addr))
            })?;
        }
        if let Ok(network) = std::env::var("INFERD_OVERLAY_NETWORK") {
            if !network.is_empty() {
                config.overlay_network = Some(network);
            }
        }
        if let Ok(host) = std::env::var("INFERD_FALLBACK_HOST") {
            if !host.is_empty() {
                config.fallback_host = host;
            }
        }
        if let Ok(secs) = std::env::var("INFERD_REAPER_INTERVAL_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                InferdError::Config(format!("invalid INFERD_REAPER_INTERVAL_SECS: {}", secs))
            })?;
            config.reaper_interval = Duration::from_secs(secs);
        }

        info!(
            bind = %config.bind_addr,
            overlay = ?config.overlay_network,
            reaper_interval_s = config.reaper_interval.as_secs(),
            "configuration loaded"
        );
        Ok(config)
    }
}
