//! Instance API: provision, list, inspect, stop, terminate.
//!
//! Provisioning composes the engine provisioner with the lifecycle tracker:
//! the container must be confirmed healthy before a row is recorded.
//! Explicit control actions propagate runtime errors to the caller, unlike
//! the background reaper which logs and retries.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

use inferd_common::{engine_by_id, InstanceStatus};
use inferd_orchestrator::{InstanceUpdate, NewInstance};
use inferd_runtime::ProvisionError;

use crate::AppState;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub user_id: String,
    pub engine_id: String,
    pub model_id: String,
    /// Overrides the engine's default idle budget. Explicit null disables
    /// auto-stop.
    #[serde(default, with = "double_option")]
    pub auto_stop_minutes: Option<Option<u64>>,
}

/// Distinguishes an absent field from an explicit null.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<u64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(de).map(Some)
    }
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found", "message": message })),
    )
        .into_response()
}

fn provision_failed(err: &ProvisionError) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({
            "error": "provision failed",
            "stage": err.stage,
            "message": err.to_string(),
        })),
    )
        .into_response()
}

pub async fn create_instance_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Response {
    let Some(engine) = engine_by_id(&req.engine_id) else {
        return not_found(&format!("unknown engine: {}", req.engine_id));
    };
    let Some(model) = state.tracker.model(&req.model_id).cloned() else {
        return not_found(&format!("unknown model: {}", req.model_id));
    };
    if model.engine_id != engine.id {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "invalid request",
                "message": format!("model {} does not run on engine {}", model.id, engine.id),
            })),
        )
            .into_response();
    }

    let provisioned = match state.provisioner.provision(&engine, &model.name).await {
        Ok(provisioned) => provisioned,
        Err(e) => {
            error!(engine = %engine.id, model = %model.id, error = %e, "provisioning failed");
            return provision_failed(&e);
        }
    };

    let auto_stop_minutes = req
        .auto_stop_minutes
        .unwrap_or(engine.default_auto_stop_minutes);

    let created = state.tracker.create(NewInstance {
        id: provisioned.container_id.clone(),
        user_id: req.user_id,
        engine_id: engine.id.clone(),
        model_id: model.id,
        container_name: provisioned.container_name,
        port: provisioned.port,
        allocated_memory_mb: engine.default_memory_mb,
        allocated_cpu_cores: engine.default_cpu_cores,
        auto_stop_minutes,
    });

    match created {
        Ok(instance) => {
            info!(id = %instance.id, port = instance.port, "instance provisioned");
            (StatusCode::CREATED, Json(instance)).into_response()
        }
        Err(e) => {
            // The container is healthy but unrecordable; don't leak it.
            error!(container = %provisioned.container_id, error = %e, "failed to record instance");
            if let Err(stop_err) = state
                .runtime
                .stop_container(&provisioned.container_id, STOP_TIMEOUT)
                .await
            {
                warn!(container = %provisioned.container_id, error = %stop_err, "orphaned container left running");
            }
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal", "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn list_instances_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(user_id) = params.get("user_id") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "invalid request",
                "message": "missing required query parameter: user_id",
            })),
        )
            .into_response();
    };
    Json(state.tracker.list_for_user(user_id)).into_response()
}

pub async fn get_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.tracker.get(&id) {
        Some(instance) => Json(instance).into_response(),
        None => not_found(&format!("unknown instance: {}", id)),
    }
}

pub async fn stop_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(instance) = state.tracker.get(&id) else {
        return not_found(&format!("unknown instance: {}", id));
    };

    if let Err(e) = state.runtime.stop_container(&instance.id, STOP_TIMEOUT).await {
        error!(%id, error = %e, "stop failed");
        return (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "error": "stop failed", "message": e.to_string() })),
        )
            .into_response();
    }

    let updated = state
        .tracker
        .update(&id, InstanceUpdate::status(InstanceStatus::Stopped));
    state.resolver.invalidate(instance.port);
    info!(%id, "instance stopped");
    Json(updated.unwrap_or(instance)).into_response()
}

pub async fn terminate_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(instance) = state.tracker.get(&id) else {
        return not_found(&format!("unknown instance: {}", id));
    };

    // Force removal kills a still-running container; no separate stop.
    if let Err(e) = state.runtime.remove_container(&instance.id).await {
        error!(%id, error = %e, "terminate failed");
        return (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "error": "terminate failed", "message": e.to_string() })),
        )
            .into_response();
    }

    state
        .tracker
        .update(&id, InstanceUpdate::status(InstanceStatus::Terminated));
    state.tracker.delete(&id);
    state.resolver.invalidate(instance.port);
    info!(%id, "instance terminated");
    StatusCode::NO_CONTENT.into_response()
}
