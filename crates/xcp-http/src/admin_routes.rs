//! Admin/introspection HTTP surface: thin JSON wrappers over
//! [`xcp_core::admin::AdminSurface`]. Mounted under `/admin` by convention;
//! operators are expected to keep this path off the public listener.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use xcp_core::admin::AdminSurface;
use xcp_core::config::Config;

use crate::error::ApiError;

#[derive(Clone)]
pub struct AdminState {
    pub admin: Arc<AdminSurface>,
    pub config: Arc<Config>,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    xcp_core::templates::DEFAULT_VERSION.to_string()
}

async fn resource_types(State(state): State<AdminState>, Query(q): Query<VersionQuery>) -> Json<Vec<String>> {
    Json(state.admin.resource_types(&q.version))
}

#[derive(Debug, Deserialize)]
pub struct NodeBody {
    #[serde(default)]
    node: Value,
    #[serde(default = "default_generation")]
    api_generation: String,
}

fn default_generation() -> String {
    "v3".to_string()
}

/// A node's metadata only ever travels as a JSON body, never a query
/// string — node documents are arbitrarily nested and don't survive
/// url-encoding.
async fn fetch_resource(
    State(state): State<AdminState>,
    Path((resource_type, name)): Path<(String, String)>,
    Json(body): Json<NodeBody>,
) -> Result<Json<Option<Value>>, ApiError> {
    let resource = state.admin.fetch_resource(&resource_type, body.node, &name, &body.api_generation).await?;
    Ok(Json(resource))
}

async fn list_resource_names(
    State(state): State<AdminState>,
    Path(resource_type): Path<String>,
    Json(body): Json<NodeBody>,
) -> Result<Json<Vec<String>>, ApiError> {
    let names = state.admin.list_resource_names(&resource_type, body.node, &body.api_generation).await?;
    Ok(Json(names))
}

async fn dump_raw_instances(State(state): State<AdminState>, Path(scope): Path<String>) -> Json<Vec<Value>> {
    Json(state.admin.dump_raw_instances(&scope))
}

async fn dump_transformed_instances(State(state): State<AdminState>, Path(scope): Path<String>) -> Json<Vec<Value>> {
    Json(state.admin.dump_transformed_instances(&scope))
}

async fn dump_selected_instances(
    State(state): State<AdminState>,
    Path(resource_type): Path<String>,
    Json(body): Json<NodeBody>,
) -> Json<Vec<Value>> {
    Json(state.admin.dump_selected_instances(&resource_type, &body.node))
}

async fn template_metadata(State(state): State<AdminState>) -> Json<Vec<xcp_core::admin::TemplateMetadata>> {
    Json(state.admin.template_metadata())
}

async fn context_snapshot(State(state): State<AdminState>) -> Json<Value> {
    Json(state.admin.context_snapshot())
}

async fn cache_stats(State(state): State<AdminState>) -> Json<xcp_core::cache::CacheStats> {
    Json(state.admin.cache_stats().await)
}

async fn metrics_counters(State(state): State<AdminState>) -> Json<xcp_core::admin::MetricsSnapshot> {
    Json(state.admin.metrics_counters().await)
}

async fn deep_check(State(state): State<AdminState>) -> Json<Vec<xcp_core::admin::DeepCheckResult>> {
    Json(state.admin.deep_check())
}

async fn effective_config(State(state): State<AdminState>) -> Json<Config> {
    Json(state.config.masked())
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    version: &'static str,
}

async fn version(State(state): State<AdminState>) -> Json<VersionResponse> {
    Json(VersionResponse { version: state.version })
}

#[derive(Debug, Deserialize)]
pub struct EncryptRequest {
    plaintext: String,
}

#[derive(Debug, Serialize)]
pub struct EncryptResponse {
    ciphertext: String,
}

async fn encrypt(
    State(state): State<AdminState>,
    Json(req): Json<EncryptRequest>,
) -> Result<Json<EncryptResponse>, ApiError> {
    let ciphertext = state.admin.encrypt(&req.plaintext)?;
    Ok(Json(EncryptResponse { ciphertext }))
}

#[derive(Debug, Deserialize)]
pub struct DecryptRequest {
    ciphertext: String,
}

#[derive(Debug, Serialize)]
pub struct DecryptResponse {
    plaintext: String,
}

async fn decrypt(
    State(state): State<AdminState>,
    Json(req): Json<DecryptRequest>,
) -> Result<Json<DecryptResponse>, ApiError> {
    let plaintext = state.admin.decrypt(&req.ciphertext)?;
    Ok(Json(DecryptResponse { plaintext }))
}

#[derive(Debug, Serialize)]
pub struct GenerateKeyResponse {
    key_hex: String,
}

async fn generate_key() -> Json<GenerateKeyResponse> {
    Json(GenerateKeyResponse { key_hex: AdminSurface::generate_key_hex() })
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/version", get(version))
        .route("/admin/config", get(effective_config))
        .route("/admin/resource_types", get(resource_types))
        .route("/admin/resources/{resource_type}/{name}", post(fetch_resource))
        .route("/admin/resources/{resource_type}", post(list_resource_names))
        .route("/admin/instances/raw/{scope}", get(dump_raw_instances))
        .route("/admin/instances/transformed/{scope}", get(dump_transformed_instances))
        .route("/admin/instances/selected/{resource_type}", post(dump_selected_instances))
        .route("/admin/templates", get(template_metadata))
        .route("/admin/templates/deep_check", get(deep_check))
        .route("/admin/context", get(context_snapshot))
        .route("/admin/cache_stats", get(cache_stats))
        .route("/admin/metrics", get(metrics_counters))
        .route("/admin/crypto/encrypt", post(encrypt))
        .route("/admin/crypto/decrypt", post(decrypt))
        .route("/admin/crypto/generate_key", post(generate_key))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::ServiceExt;
    use xcp_core::auth::AuthGate;
    use xcp_core::cache::DiscoveryCache;
    use xcp_core::cipher::{CipherKey, CipherSuite};
    use xcp_core::context::TemplateContext;
    use xcp_core::discovery::DiscoveryEngine;
    use xcp_core::instances::{InlineSource, Instance, SourceEntry, SourcePoller};
    use xcp_core::matcher::MatchingConfig;
    use xcp_core::templates::{TemplateArtifact, TemplateRegistry};

    async fn build_state() -> AdminState {
        let sources = vec![SourceEntry {
            scope: "clusters".to_string(),
            source: Arc::new(InlineSource::new(vec![Instance::new(
                json!({"name": "a", "service_clusters": ["*"]}),
            )])),
        }];
        let poller = Arc::new(SourcePoller::new(sources, vec![], vec![], Duration::from_secs(3600)));
        poller.initial_load().await.unwrap();

        let mut templates = TemplateRegistry::new();
        templates.register(
            "clusters",
            "default",
            TemplateArtifact::compile_tera(
                "t",
                "resources:\n{% for i in instances %}  - name: {{ i.name }}\n{% endfor %}",
            )
            .unwrap(),
        );

        let cipher = Arc::new(CipherSuite::new(vec![CipherKey::generate()], vec![]).unwrap());
        let auth = AuthGate::new(Default::default(), cipher.clone());

        let engine = Arc::new(DiscoveryEngine::new(
            poller,
            Arc::new(templates),
            Arc::new(TemplateContext::new()),
            Arc::new(DiscoveryCache::new(100, Duration::from_secs(60))),
            cipher,
            auth,
            MatchingConfig { enabled: true, ..Default::default() },
            BTreeMap::new(),
            BTreeMap::new(),
        ));

        AdminState {
            admin: Arc::new(AdminSurface::new(engine)),
            config: Arc::new(Config::default()),
            version: "test",
        }
    }

    #[tokio::test]
    async fn resource_types_lists_registered_template() {
        let app = admin_router(build_state().await);
        let response = app
            .oneshot(Request::builder().uri("/admin/resource_types").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, vec!["clusters".to_string()]);
    }

    #[tokio::test]
    async fn config_endpoint_masks_secrets() {
        let mut config = Config::default();
        config.cipher.aead_key_specs = vec!["env://SECRET_KEY".to_string()];
        let mut state = build_state().await;
        state.config = Arc::new(config);
        let app = admin_router(state);
        let response =
            app.oneshot(Request::builder().uri("/admin/config").body(Body::empty()).unwrap()).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["cipher"]["aead_key_specs"][0], "<redacted>");
    }

    #[tokio::test]
    async fn list_resource_names_takes_node_as_json_body() {
        let app = admin_router(build_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/resources/clusters")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&json!({"node": {"cluster": "x"}, "api_generation": "v3"})).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let names: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn crypto_round_trip_through_http() {
        let app = admin_router(build_state().await);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/crypto/encrypt")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&json!({"plaintext": "hunter2"})).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let encrypted: EncryptResponse = serde_json::from_slice(&bytes).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/crypto/decrypt")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&json!({"ciphertext": encrypted.ciphertext})).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decrypted: DecryptResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decrypted.plaintext, "hunter2");
    }

    #[tokio::test]
    async fn metrics_counters_starts_at_zero() {
        let app = admin_router(build_state().await);
        let response =
            app.oneshot(Request::builder().uri("/admin/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: xcp_core::admin::MetricsSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.poll_failed_total, 0);
        assert_eq!(parsed.context_refresh_failed_total, 0);
    }

    #[tokio::test]
    async fn raw_and_transformed_instance_dumps_are_both_reachable() {
        let app = admin_router(build_state().await);
        for path in ["/admin/instances/raw/clusters", "/admin/instances/transformed/clusters"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let parsed: Vec<Value> = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(parsed.len(), 1);
        }
    }
}
