//! Admin/introspection surface.
//!
//! Every operation here is a thin wrapper over [`DiscoveryEngine`] and the
//! stores it owns — there is no second rendering path. A resource fetched
//! through the admin surface has gone through the exact same auth, matcher,
//! template, and cache logic as a proxy's discovery request.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::cipher::CipherSuite;
use crate::discovery::{DiscoveryEngine, DiscoveryOutcome, DiscoveryRequest};
use crate::error::Result;
use crate::matcher;

/// Per-template metadata, as returned by [`AdminSurface::template_metadata`].
#[derive(Debug, Clone, Serialize)]
pub struct TemplateMetadata {
    pub resource_type: String,
    pub version: String,
    pub checksum: String,
    pub free_identifiers: Vec<String>,
    pub is_pass_through: bool,
}

pub struct AdminSurface {
    engine: Arc<DiscoveryEngine>,
}

impl AdminSurface {
    pub fn new(engine: Arc<DiscoveryEngine>) -> Self {
        Self { engine }
    }

    /// Resource types with a registered template for `version` (or a default
    /// fallback).
    pub fn resource_types(&self, version: &str) -> Vec<String> {
        self.engine.templates().resource_types_for_version(version)
    }

    /// Fetch a single resource by name, routed through the same
    /// [`DiscoveryEngine::discover`] pipeline a proxy request would take.
    pub async fn fetch_resource(
        &self,
        resource_type: &str,
        node: Value,
        name: &str,
        api_generation: &str,
    ) -> Result<Option<Value>> {
        let request = DiscoveryRequest {
            resource_type: resource_type.to_string(),
            node,
            requested_names: vec![name.to_string()],
            version_info_in: String::new(),
            host_header: None,
            api_generation: api_generation.to_string(),
        };
        match self.engine.discover(request, None).await? {
            DiscoveryOutcome::Changed(response) => Ok(response.resources.into_iter().next()),
            DiscoveryOutcome::Unchanged => Ok(None),
        }
    }

    /// All resource names a node is currently entitled to for a resource
    /// type, after node matching and rendering.
    pub async fn list_resource_names(
        &self,
        resource_type: &str,
        node: Value,
        api_generation: &str,
    ) -> Result<Vec<String>> {
        let request = DiscoveryRequest {
            resource_type: resource_type.to_string(),
            node,
            requested_names: vec![],
            version_info_in: String::new(),
            host_header: None,
            api_generation: api_generation.to_string(),
        };
        match self.engine.discover(request, None).await? {
            DiscoveryOutcome::Changed(response) => Ok(response
                .resources
                .iter()
                .filter_map(|r| r.get("name").and_then(Value::as_str).map(str::to_string))
                .collect()),
            DiscoveryOutcome::Unchanged => Ok(vec![]),
        }
    }

    /// Pre-transform contents of a scope, exactly as sources produced them.
    /// Useful for telling a bad source apart from a bad transform.
    pub fn dump_raw_instances(&self, scope: &str) -> Vec<Value> {
        self.engine.poller().snapshot_raw().raw_scope(scope).iter().map(|i| i.fields().clone()).collect()
    }

    /// Post-transform contents of a scope, straight from the instance store,
    /// before node matching is applied.
    pub fn dump_transformed_instances(&self, scope: &str) -> Vec<Value> {
        self.engine.poller().snapshot().raw_scope(scope).iter().map(|i| i.fields().clone()).collect()
    }

    /// Instances a given node would actually see for a resource type, after
    /// node matching but before template rendering.
    pub fn dump_selected_instances(&self, resource_type: &str, node: &Value) -> Vec<Value> {
        let snapshot = self.engine.poller().snapshot();
        matcher::select(&snapshot, node, resource_type, self.engine.matching())
            .into_iter()
            .map(|i| i.fields().clone())
            .collect()
    }

    /// Metadata for every registered `(resource_type, version)` template
    /// pair: checksum, free identifiers, and whether it is a pass-through
    /// (native) template.
    pub fn template_metadata(&self) -> Vec<TemplateMetadata> {
        self.engine
            .templates()
            .all_pairs()
            .into_iter()
            .filter_map(|(resource_type, version)| {
                let artifact = self.engine.templates().get_exact(&resource_type, &version)?;
                Some(TemplateMetadata {
                    resource_type,
                    version,
                    checksum: artifact.checksum.clone(),
                    free_identifiers: artifact.free_identifiers.iter().cloned().collect(),
                    is_pass_through: artifact.is_pass_through(),
                })
            })
            .collect()
    }

    /// The template context's current values, unpruned — the full set
    /// available to any template.
    pub fn context_snapshot(&self) -> Value {
        self.engine.context().snapshot()
    }

    /// Current discovery cache hit/miss/eviction counters.
    pub async fn cache_stats(&self) -> crate::cache::CacheStats {
        self.engine.cache_stats().await
    }

    /// Minimal operational counters: cache hits/misses plus cumulative
    /// background-task failure counts. Not a replacement for a real metrics
    /// pipeline, just enough to tell "is this deployment healthy" from the
    /// admin API without one.
    pub async fn metrics_counters(&self) -> MetricsSnapshot {
        let cache = self.engine.cache_stats().await;
        MetricsSnapshot {
            discovery_cache_hits: cache.hits,
            discovery_cache_misses: cache.misses,
            poll_failed_total: self.engine.poller().poll_failed_total(),
            context_refresh_failed_total: self.engine.context().refresh_failed_total(),
        }
    }

    /// Render every registered `(resource_type, version)` template pair
    /// against a synthesized empty request, reporting which ones fail
    /// outside of a live proxy request ever hitting them.
    pub fn deep_check(&self) -> Vec<DeepCheckResult> {
        self.engine
            .templates()
            .all_pairs()
            .into_iter()
            .map(|(resource_type, version)| {
                let outcome = self
                    .engine
                    .templates()
                    .for_request(&version, &resource_type)
                    .and_then(|artifact| artifact.render(&synthetic_render_context()));
                match outcome {
                    Ok(_) => DeepCheckResult { resource_type, version, ok: true, error: None },
                    Err(e) => DeepCheckResult { resource_type, version, ok: false, error: Some(e.to_string()) },
                }
            })
            .collect()
    }

    /// Encrypt a plaintext under the live cipher suite's primary key.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        self.engine.cipher().encrypt(plaintext)
    }

    /// Decrypt a ciphertext, trialling every configured key in order.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        self.engine.cipher().decrypt(ciphertext)
    }

    /// Whether a ciphertext can be decrypted under the live cipher suite.
    pub fn decryptable(&self, ciphertext: &str) -> bool {
        self.engine.cipher().decryptable(ciphertext)
    }

    /// Generate a fresh key, hex-encoded for transport. Does not register
    /// the key anywhere — an operator copies it into the cipher
    /// configuration to perform a rotation.
    pub fn generate_key_hex() -> String {
        hex::encode(CipherSuite::generate_key().as_bytes())
    }
}

/// Snapshot returned by [`AdminSurface::metrics_counters`].
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub discovery_cache_hits: u64,
    pub discovery_cache_misses: u64,
    pub poll_failed_total: u64,
    pub context_refresh_failed_total: u64,
}

fn synthetic_render_context() -> Value {
    serde_json::json!({
        "instances": [],
        "node": {},
        "requested_names": [],
        "host_header": "",
    })
}

/// Result of rendering one `(resource_type, version)` pair during a deep
/// check.
#[derive(Debug, Clone, Serialize)]
pub struct DeepCheckResult {
    pub resource_type: String,
    pub version: String,
    pub ok: bool,
    pub error: Option<String>,
}
