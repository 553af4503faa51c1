//! HTTP gateway for ephemeral inference workloads.
//!
//! One axum app serves two surfaces: the instance API (provision, list,
//! stop, terminate) and the streaming proxy (chat and audio traffic relayed
//! to whichever container owns the `port` query parameter).

use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use inferd_common::builtin_models;
use inferd_orchestrator::InstanceTracker;
use inferd_runtime::{
    ContainerRuntime, EngineProvisioner, ProvisionerConfig, ResolverConfig, UpstreamResolver,
};

pub mod config;
pub mod instances;
pub mod proxy;

use config::ServerConfig;
use proxy::ProxyClient;

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<InstanceTracker>,
    pub provisioner: Arc<EngineProvisioner>,
    pub resolver: Arc<UpstreamResolver>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub proxy: Arc<ProxyClient>,
}

impl AppState {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &ServerConfig) -> Self {
        let provisioner_config = ProvisionerConfig {
            overlay_network: config.overlay_network.clone(),
            ..ProvisionerConfig::default()
        };
        Self::with_provisioner_config(runtime, config, provisioner_config)
    }

    pub fn with_provisioner_config(
        runtime: Arc<dyn ContainerRuntime>,
        config: &ServerConfig,
        provisioner_config: ProvisionerConfig,
    ) -> Self {
        let resolver = Arc::new(UpstreamResolver::new(
            runtime.clone(),
            ResolverConfig {
                overlay_network: config.overlay_network.clone(),
                fallback_host: config.fallback_host.clone(),
            },
        ));
        let provisioner = Arc::new(EngineProvisioner::new(
            runtime.clone(),
            resolver.clone(),
            provisioner_config,
        ));
        let tracker = Arc::new(InstanceTracker::new(builtin_models()));
        let proxy = Arc::new(ProxyClient::new(resolver.clone()));

        Self {
            tracker,
            provisioner,
            resolver,
            runtime,
            proxy,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Streaming proxy surface
        .route("/health", get(proxy::health_handler))
        .route("/chat", post(proxy::chat_handler))
        .route("/audio/transcriptions", post(proxy::transcriptions_handler))
        .route("/audio/translations", post(proxy::translations_handler))
        // Instance API
        .route("/api/v1/instances", post(instances::create_instance_handler))
        .route("/api/v1/instances", get(instances::list_instances_handler))
        .route("/api/v1/instances/:id", get(instances::get_instance_handler))
        .route(
            "/api/v1/instances/:id/stop",
            post(instances::stop_instance_handler),
        )
        .route(
            "/api/v1/instances/:id",
            delete(instances::terminate_instance_handler),
        )
        // Gateway's own liveness, distinct from proxied upstream health
        .route("/healthz", get(healthz_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
