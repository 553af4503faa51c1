//! Engine provisioning: turn an (engine, model) request into a running,
//! health-checked container with a reachable port.
//!
//! Provisioning is a pure capability: it creates and starts a container but
//! persists nothing. The caller composes the returned handle with the
//! lifecycle tracker.

use inferd_common::Engine;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::gateway::{ContainerRuntime, WorkloadSpec};
use crate::resolver::UpstreamResolver;

/// Where provisioning gave up. Surfaced verbatim to the caller; none of
/// these are retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionStage {
    ImagePull,
    Create,
    Start,
    PortMissing,
    HealthTimeout,
}

impl Display for ProvisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisionStage::ImagePull => "image-pull",
            ProvisionStage::Create => "create",
            ProvisionStage::Start => "start",
            ProvisionStage::PortMissing => "port-missing",
            ProvisionStage::HealthTimeout => "health-timeout",
        };
        write!(f, "{}", s)
    }
}

#[derive(Error, Debug)]
#[error("provisioning failed at {stage}: {message}")]
pub struct ProvisionError {
    pub stage: ProvisionStage,
    pub message: String,
}

impl ProvisionError {
    fn new(stage: ProvisionStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub container_id: String,
    pub container_name: String,
    pub port: u16,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Overlay network freshly provisioned containers attach to.
    pub overlay_network: Option<String>,
    pub health_probe_interval: Duration,
    pub health_probe_attempts: u32,
    /// Absolute safety net around the image pull.
    pub pull_timeout: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            overlay_network: None,
            health_probe_interval: Duration::from_millis(1500),
            health_probe_attempts: 30,
            pull_timeout: Duration::from_secs(600),
        }
    }
}

pub struct EngineProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<UpstreamResolver>,
    config: ProvisionerConfig,
    probe_client: reqwest::Client,
}

impl EngineProvisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<UpstreamResolver>,
        config: ProvisionerConfig,
    ) -> Self {
        let probe_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            runtime,
            resolver,
            config,
            probe_client,
        }
    }

    /// Provision a container for `engine` serving `model_name`, blocking
    /// until it answers its health probe.
    #[instrument(skip(self, engine), fields(engine = %engine.id, model = %model_name))]
    pub async fn provision(
        &self,
        engine: &Engine,
        model_name: &str,
    ) -> std::result::Result<Provisioned, ProvisionError> {
        self.ensure_image(&engine.image).await?;

        let name = container_name(&engine.id);
        let spec = self.workload_spec(engine, model_name, &name);

        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| ProvisionError::new(ProvisionStage::Create, e.to_string()))?;

        if let Err(e) = self.runtime.start_container(&container_id).await {
            return Err(ProvisionError::new(ProvisionStage::Start, e.to_string()));
        }

        // Read back the port the daemon assigned. A missing binding is
        // fatal, never silently retried.
        let port = match self
            .runtime
            .host_port(&container_id, engine.internal_port)
            .await
        {
            Ok(Some(port)) => port,
            Ok(None) => {
                return Err(ProvisionError::new(
                    ProvisionStage::PortMissing,
                    format!(
                        "no host port bound for {}/tcp on container {}",
                        engine.internal_port, container_id
                    ),
                ));
            }
            Err(e) => {
                return Err(ProvisionError::new(
                    ProvisionStage::PortMissing,
                    e.to_string(),
                ));
            }
        };

        info!(%container_id, %port, "container started, waiting for health");
        self.wait_for_health(&container_id, port, &engine.health_path)
            .await?;

        Ok(Provisioned {
            container_id,
            container_name: name,
            port,
            model: model_name.to_string(),
        })
    }

    async fn ensure_image(&self, image: &str) -> std::result::Result<(), ProvisionError> {
        if self.runtime.image_present(image).await {
            debug!(%image, "image already present");
            return Ok(());
        }
        match tokio::time::timeout(self.config.pull_timeout, self.runtime.pull_image(image)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProvisionError::new(ProvisionStage::ImagePull, e.to_string())),
            Err(_) => Err(ProvisionError::new(
                ProvisionStage::ImagePull,
                format!(
                    "pull of {} exceeded {}s",
                    image,
                    self.config.pull_timeout.as_secs()
                ),
            )),
        }
    }

    fn workload_spec(&self, engine: &Engine, model_name: &str, name: &str) -> WorkloadSpec {
        let mut labels = HashMap::new();
        labels.insert("inferd.engine".to_string(), engine.id.clone());
        labels.insert("inferd.model".to_string(), model_name.to_string());

        WorkloadSpec {
            image: engine.image.clone(),
            name: name.to_string(),
            env: Vec::new(),
            internal_port: engine.internal_port,
            memory_mb: engine.default_memory_mb,
            cpu_cores: engine.default_cpu_cores,
            volume_bind: engine
                .model_volume
                .as_ref()
                .map(|v| format!("{}:{}:ro", v.name, v.container_path)),
            network: self.config.overlay_network.clone(),
            labels,
        }
    }

    /// Poll the health endpoint on a fixed interval for a bounded number of
    /// attempts. Individual probe failures (refused, timeout, non-2xx) are
    /// swallowed; only an exhausted budget is reported.
    async fn wait_for_health(
        &self,
        container_id: &str,
        port: u16,
        health_path: &str,
    ) -> std::result::Result<(), ProvisionError> {
        for attempt in 1..=self.config.health_probe_attempts {
            let url = self.resolver.resolve(port, health_path).await;
            match self.probe_client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(%container_id, attempt, "health probe passed");
                    return Ok(());
                }
                Ok(resp) => {
                    debug!(%container_id, attempt, status = %resp.status(), "health probe not ready");
                }
                Err(e) => {
                    debug!(%container_id, attempt, error = %e, "health probe failed");
                }
            }
            tokio::time::sleep(self.config.health_probe_interval).await;
        }

        // Don't leave an unhealthy container burning memory.
        if let Err(e) = self
            .runtime
            .stop_container(container_id, Duration::from_secs(5))
            .await
        {
            warn!(%container_id, error = %e, "failed to stop unhealthy container");
        }

        Err(ProvisionError::new(
            ProvisionStage::HealthTimeout,
            format!(
                "container {} not healthy after {} attempts",
                container_id, self.config.health_probe_attempts
            ),
        ))
    }
}

fn container_name(engine_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("inferd-{}-{}", engine_id, &suffix[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolverConfig;
    use crate::test_utils::MockRuntime;
    use inferd_common::engine_by_id;

    fn fast_config() -> ProvisionerConfig {
        ProvisionerConfig {
            overlay_network: None,
            health_probe_interval: Duration::from_millis(10),
            health_probe_attempts: 3,
            pull_timeout: Duration::from_secs(5),
        }
    }

    fn provisioner(runtime: Arc<MockRuntime>, config: ProvisionerConfig) -> EngineProvisioner {
        let resolver = Arc::new(UpstreamResolver::new(
            runtime.clone(),
            ResolverConfig::default(),
        ));
        EngineProvisioner::new(runtime, resolver, config)
    }

    /// Serve 200 on a random loopback port; returns the port.
    async fn spawn_health_server() -> u16 {
        use axum::{routing::get, Router};
        let app = Router::new().route(
            "/api/version",
            get(|| async { axum::Json(serde_json::json!({"version": "0.5.1"})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_provision_happy_path() {
        let port = spawn_health_server().await;
        let runtime = Arc::new(MockRuntime::new());
        runtime.mark_image_present("ollama/ollama:latest");
        runtime.set_next_host_port(port);

        let engine = engine_by_id("ollama").unwrap();
        let provisioned = provisioner(runtime.clone(), fast_config())
            .provision(&engine, "qwen2:0.5b")
            .await
            .expect("provision should succeed");

        assert_eq!(provisioned.port, port);
        assert_eq!(provisioned.model, "qwen2:0.5b");
        let created = runtime.created_containers();
        assert_eq!(created.len(), 1);
        assert!(created[0].running);
        assert!(created[0].spec_name.starts_with("inferd-ollama-"));
    }

    #[tokio::test]
    async fn test_provision_pull_failure() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_pull();
        let engine = engine_by_id("ollama").unwrap();

        let err = provisioner(runtime, fast_config())
            .provision(&engine, "qwen2:0.5b")
            .await
            .unwrap_err();
        assert_eq!(err.stage, ProvisionStage::ImagePull);
    }

    #[tokio::test]
    async fn test_provision_missing_port_is_fatal() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.mark_image_present("ollama/ollama:latest");
        runtime.suppress_host_port();
        let engine = engine_by_id("ollama").unwrap();

        let err = provisioner(runtime, fast_config())
            .provision(&engine, "qwen2:0.5b")
            .await
            .unwrap_err();
        assert_eq!(err.stage, ProvisionStage::PortMissing);
    }

    #[tokio::test]
    async fn test_provision_start_failure() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.mark_image_present("ollama/ollama:latest");
        runtime.fail_start();
        let engine = engine_by_id("ollama").unwrap();

        let err = provisioner(runtime, fast_config())
            .provision(&engine, "qwen2:0.5b")
            .await
            .unwrap_err();
        assert_eq!(err.stage, ProvisionStage::Start);
    }

    #[tokio::test]
    async fn test_provision_health_timeout_stops_container() {
        // Nothing listens on the assigned port, so every probe fails.
        let runtime = Arc::new(MockRuntime::new());
        runtime.mark_image_present("ollama/ollama:latest");
        let engine = engine_by_id("ollama").unwrap();

        let err = provisioner(runtime.clone(), fast_config())
            .provision(&engine, "qwen2:0.5b")
            .await
            .unwrap_err();
        assert_eq!(err.stage, ProvisionStage::HealthTimeout);

        let created = runtime.created_containers();
        assert_eq!(created.len(), 1);
        assert!(!created[0].running, "unhealthy container should be stopped");
    }
}
