//! Streaming proxy: route client requests to the container behind a host
//! port, relaying bodies byte-for-byte.
//!
//! The proxy validates the `port` query parameter before any upstream or
//! resolver work, forwards method/body/content-type unchanged, and streams
//! the upstream response back without buffering. Activity touches on the
//! audio endpoints are fire-and-forget: they must never block or fail the
//! proxied response.

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use inferd_common::engine_by_id;
use inferd_orchestrator::InstanceTracker;
use inferd_runtime::UpstreamResolver;

use crate::AppState;

/// Upstream path each proxy route forwards to.
const CHAT_PATH: &str = "/api/chat";
const TRANSCRIPTIONS_PATH: &str = "/v1/audio/transcriptions";
const TRANSLATIONS_PATH: &str = "/v1/audio/translations";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP plumbing shared by all proxy routes: a short-timeout client for
/// health checks and an untimed client for streamed forwards (bounded by
/// the client's own disconnect, not by us).
pub struct ProxyClient {
    resolver: Arc<UpstreamResolver>,
    health_client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl ProxyClient {
    pub fn new(resolver: Arc<UpstreamResolver>) -> Self {
        Self {
            resolver,
            health_client: reqwest::Client::builder()
                .timeout(HEALTH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            stream_client: reqwest::Client::new(),
        }
    }

    /// Forward a request to the upstream behind `port`, streaming both
    /// directions. Connection failure maps to 502, never a raw error.
    pub async fn forward(&self, port: u16, path: &str, req: Request) -> Response {
        let method = req.method().clone();
        let content_type = req.headers().get(header::CONTENT_TYPE).cloned();
        let url = self.resolver.resolve(port, path).await;

        let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());
        let mut upstream = self.stream_client.request(method, &url).body(body);
        if let Some(ct) = content_type {
            upstream = upstream.header(header::CONTENT_TYPE, ct);
        }

        match upstream.send().await {
            Ok(resp) => relay_response(resp),
            Err(e) => {
                warn!(%port, %url, error = %e, "upstream connection failed");
                bad_gateway(&e.to_string())
            }
        }
    }

    /// Probe the upstream's health endpoint. "Unhealthy" is a valid answer,
    /// not a fault: the result is always `{"ok": bool}` with status 200.
    pub async fn check_health(&self, port: u16, health_path: &str) -> bool {
        let url = self.resolver.resolve(port, health_path).await;
        match self.health_client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(%port, error = %e, "upstream health check failed");
                false
            }
        }
    }
}

/// Relay the upstream response as a live byte stream, preserving its status
/// and content-type and disabling caching.
fn relay_response(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let content_type = resp.headers().get(header::CONTENT_TYPE).cloned();

    let mut builder = Response::builder()
        .status(status)
        .header(header::CACHE_CONTROL, "no-cache");
    if let Some(ct) = content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Validate `port` as a TCP port before anything touches the resolver.
fn parse_port(params: &HashMap<String, String>) -> Result<u16, Response> {
    let raw = params
        .get("port")
        .ok_or_else(|| client_error("missing required query parameter: port"))?;
    let value: i64 = raw
        .parse()
        .map_err(|_| client_error(&format!("port is not an integer: {}", raw)))?;
    if !(1..=65535).contains(&value) {
        return Err(client_error(&format!("port out of range: {}", value)));
    }
    Ok(value as u16)
}

fn client_error(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "invalid request", "message": message })),
    )
        .into_response()
}

fn bad_gateway(message: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({ "error": "bad gateway", "message": message })),
    )
        .into_response()
}

/// Detached activity touch. Errors are discarded by design: the touch is a
/// side effect, never a correctness dependency of the proxied response.
fn touch_detached(tracker: Arc<InstanceTracker>, port: u16) {
    tokio::spawn(async move {
        tracker.touch_by_port(port);
    });
}

pub async fn health_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let port = match parse_port(&params) {
        Ok(port) => port,
        Err(resp) => return resp,
    };

    // The health path belongs to the engine behind the port; fall back to
    // "/" when no tracked instance owns it.
    let health_path = state
        .tracker
        .get_by_port(port)
        .and_then(|i| engine_by_id(&i.engine_id))
        .map(|e| e.health_path)
        .unwrap_or_else(|| "/".to_string());

    let ok = state.proxy.check_health(port, &health_path).await;
    Json(serde_json::json!({ "ok": ok })).into_response()
}

pub async fn chat_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    let port = match parse_port(&params) {
        Ok(port) => port,
        Err(resp) => return resp,
    };
    state.proxy.forward(port, CHAT_PATH, req).await
}

pub async fn transcriptions_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    let port = match parse_port(&params) {
        Ok(port) => port,
        Err(resp) => return resp,
    };
    touch_detached(state.tracker.clone(), port);
    state.proxy.forward(port, TRANSCRIPTIONS_PATH, req).await
}

pub async fn translations_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    let port = match parse_port(&params) {
        Ok(port) => port,
        Err(resp) => return resp,
    };
    touch_detached(state.tracker.clone(), port);
    state.proxy.forward(port, TRANSLATIONS_PATH, req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_valid() {
        let mut params = HashMap::new();
        params.insert("port".to_string(), "32768".to_string());
        assert_eq!(parse_port(&params).unwrap(), 32768);
    }

    #[test]
    fn test_parse_port_rejects_out_of_range() {
        for raw in ["0", "70000", "-1", "65536"] {
            let mut params = HashMap::new();
            params.insert("port".to_string(), raw.to_string());
            assert!(parse_port(&params).is_err(), "{} should be rejected", raw);
        }
    }

    #[test]
    fn test_parse_port_rejects_garbage_and_absence() {
        let mut params = HashMap::new();
        params.insert("port".to_string(), "not-a-port".to_string());
        assert!(parse_port(&params).is_err());
        assert!(parse_port(&HashMap::new()).is_err());
    }
}
