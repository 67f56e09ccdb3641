//! The proxy-facing discovery endpoint, mounted once per resource type
//! under both the `v2` and `v3` path families.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use xcp_core::discovery::{DiscoveryEngine, DiscoveryOutcome, DiscoveryRequest};

use crate::error::ApiError;

/// Status returned to a proxy whose `version_info` already matches the
/// current fingerprint. 304 by convention; configurable since some proxies
/// expect a 2xx with an empty resource list instead.
#[derive(Clone, Copy)]
pub struct NoChangeStatus(pub StatusCode);

impl Default for NoChangeStatus {
    fn default() -> Self {
        Self(StatusCode::NOT_MODIFIED)
    }
}

/// Shared state behind every discovery route.
#[derive(Clone)]
pub struct DiscoveryState {
    pub engine: Arc<DiscoveryEngine>,
    pub no_change_status: NoChangeStatus,
    pub request_deadline: Option<Duration>,
    pub api_generation: String,
    pub server_version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct DiscoveryBody {
    pub node: Value,
    #[serde(default)]
    pub resource_names: Vec<String>,
    #[serde(default)]
    pub version_info: String,
}

async fn discover(
    State(state): State<DiscoveryState>,
    resource_type: String,
    headers: HeaderMap,
    Json(body): Json<DiscoveryBody>,
) -> Result<Response, ApiError> {
    let host_header = headers.get(axum::http::header::HOST).and_then(|v| v.to_str().ok()).map(str::to_string);
    let build_version = body.node.get("build_version").and_then(Value::as_str).map(str::to_string);
    let requested_names = body.resource_names.clone();

    let request = DiscoveryRequest {
        resource_type: resource_type.clone(),
        node: body.node,
        requested_names: requested_names.clone(),
        version_info_in: body.version_info,
        host_header,
        api_generation: state.api_generation.to_string(),
    };

    let outcome = state.engine.discover(request, state.request_deadline).await?;

    let (status, mut response) = match outcome {
        DiscoveryOutcome::Changed(body) => (StatusCode::OK, Json(body).into_response()),
        DiscoveryOutcome::Unchanged => (state.no_change_status.0, state.no_change_status.0.into_response()),
    };
    *response.status_mut() = status;

    let headers = response.headers_mut();
    if let Some(build_version) = build_version.and_then(|v| HeaderValue::from_str(&v).ok()) {
        headers.insert("x-xcp-client-build-version", build_version);
    }
    if let Ok(value) = HeaderValue::from_str(&resource_type) {
        headers.insert("x-xcp-resource-type", value);
    }
    if let Ok(value) = HeaderValue::from_str(&requested_names.join(",")) {
        headers.insert("x-xcp-resource-names", value);
    }
    if let Ok(value) = HeaderValue::from_str(state.server_version) {
        headers.insert("x-xcp-server-version", value);
    }

    Ok(response)
}

/// Mount one discovery route for a single known resource type, e.g.
/// `discovery_router_for(state, "clusters")` serves
/// `POST /{v2,v3}/discovery:clusters`.
pub fn discovery_router_for(state: DiscoveryState, resource_type: &str) -> Router {
    let path = format!("/{}/discovery:{}", state.api_generation, resource_type);
    let resource_type = resource_type.to_string();
    Router::new()
        .route(
            &path,
            post(move |s: State<DiscoveryState>, h: HeaderMap, b: Json<DiscoveryBody>| {
                let resource_type = resource_type.clone();
                async move { discover(s, resource_type, h, b).await }
            }),
        )
        .with_state(state)
}

/// Mount discovery routes for several resource types under one router,
/// e.g. the set a deployment configures templates for.
pub fn discovery_router_for_all(state: DiscoveryState, resource_types: &[String]) -> Router {
    resource_types.iter().fold(Router::new(), |router, resource_type| {
        router.merge(discovery_router_for(state.clone(), resource_type))
    })
}
