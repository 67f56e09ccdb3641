//! The discovery engine: fingerprint -> cache lookup -> render -> parse ->
//! resource filter -> version stamp -> response.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::auth::AuthGate;
use crate::cache::DiscoveryCache;
use crate::cipher::CipherSuite;
use crate::context::TemplateContext;
use crate::error::{Error, Result};
use crate::fingerprint::FingerprintInputs;
use crate::instances::SourcePoller;
use crate::matcher::{self, MatchingConfig};
use crate::templates::TemplateRegistry;

/// Incoming discovery request, already parsed from the transport layer.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub resource_type: String,
    pub node: Value,
    pub requested_names: Vec<String>,
    pub version_info_in: String,
    pub host_header: Option<String>,
    /// The proxy's API generation, e.g. `"v2"` or `"v3"` — selects which
    /// `@type` URL map to consult.
    pub api_generation: String,
}

/// Response body returned to the proxy on a change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub version_info: String,
    pub resources: Vec<Value>,
}

/// Result of a `discover` call: either a fresh/cached body, or the
/// unchanged short-circuit.
#[derive(Debug, Clone)]
pub enum DiscoveryOutcome {
    Changed(DiscoveryResponse),
    Unchanged,
}

/// Everything the engine needs besides the per-request inputs.
pub struct DiscoveryEngine {
    poller: Arc<SourcePoller>,
    templates: Arc<TemplateRegistry>,
    context: Arc<TemplateContext>,
    cache: Arc<DiscoveryCache>,
    cipher: Arc<CipherSuite>,
    auth: AuthGate,
    matching: MatchingConfig,
    type_url_map: BTreeMap<(String, String), String>,
    extra_fingerprint_keys: BTreeMap<String, String>,
    cache_enabled: bool,
}

impl DiscoveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        poller: Arc<SourcePoller>,
        templates: Arc<TemplateRegistry>,
        context: Arc<TemplateContext>,
        cache: Arc<DiscoveryCache>,
        cipher: Arc<CipherSuite>,
        auth: AuthGate,
        matching: MatchingConfig,
        type_url_map: BTreeMap<(String, String), String>,
        extra_fingerprint_keys: BTreeMap<String, String>,
    ) -> Self {
        Self {
            poller,
            templates,
            context,
            cache,
            cipher,
            auth,
            matching,
            type_url_map,
            extra_fingerprint_keys,
            cache_enabled: true,
        }
    }

    /// Toggle the discovery cache's `discovery_cache.enabled` switch. When
    /// disabled, every request renders fresh; `version_info` and unchanged
    /// semantics are unaffected since those depend only on the fingerprint.
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// The live instance store, exposed read-only for the admin surface.
    pub fn poller(&self) -> &Arc<SourcePoller> {
        &self.poller
    }

    /// The template registry, exposed read-only for the admin surface.
    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    /// The template context, exposed read-only for the admin surface.
    pub fn context(&self) -> &Arc<TemplateContext> {
        &self.context
    }

    /// The node-matching configuration this engine was built with.
    pub fn matching(&self) -> &MatchingConfig {
        &self.matching
    }

    /// Current discovery cache statistics.
    pub async fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats().await
    }

    /// The active cipher suite, exposed for the admin surface's crypto
    /// helper endpoints.
    pub fn cipher(&self) -> &Arc<CipherSuite> {
        &self.cipher
    }

    /// Run the full discovery pipeline for one request, optionally bounded
    /// by a deadline. If the deadline expires before the response is fully
    /// built, no cache write is performed.
    pub async fn discover(
        &self,
        request: DiscoveryRequest,
        deadline: Option<Duration>,
    ) -> Result<DiscoveryOutcome> {
        self.auth.check(&request.node)?;

        let proxy_version = extract_proxy_version(&request.node);
        let template = self.templates.for_request(&proxy_version, &request.resource_type)?;

        let snapshot = self.poller.snapshot();
        let selected = matcher::select(&snapshot, &request.node, &request.resource_type, &self.matching);

        let pruned_context = self.context.pruned(&template.free_identifiers);
        let context_checksum = checksum_of_value(&pruned_context);
        let node_match_value =
            matcher::extract_path(&request.node, &self.matching.node_key).map(|v| canonical_string(&v));

        let inputs = FingerprintInputs {
            resource_type: request.resource_type.clone(),
            proxy_version: proxy_version.clone(),
            requested_names: request.requested_names.clone(),
            node_match_key_value: node_match_value,
            host_header: request.host_header.clone(),
            template_checksum: template.checksum.clone(),
            context_checksum,
            instances_generation: snapshot.generation().to_string(),
            cipher_suite_identity: self.cipher.identity(),
            api_generation: request.api_generation.clone(),
            extra_keys: self.extra_fingerprint_keys.clone(),
        };
        let fingerprint = inputs.compute();

        if request.version_info_in == fingerprint {
            return Ok(DiscoveryOutcome::Unchanged);
        }

        if self.cache_enabled {
            if let Some(cached) = self.cache.get(&fingerprint).await {
                let response: DiscoveryResponse = serde_json::from_str(&cached)
                    .map_err(|e| Error::internal(format!("corrupt cache entry: {e}")))?;
                return Ok(DiscoveryOutcome::Changed(response));
            }
        }

        let instances_json: Vec<Value> = selected.iter().map(|i| i.fields().clone()).collect();
        let build = self.render_and_finish(&request, template, pruned_context, instances_json, &fingerprint);

        match deadline {
            Some(d) => tokio::time::timeout(d, build).await.map_err(|_| Error::Timeout)?,
            None => build.await,
        }
    }

    async fn render_and_finish(
        &self,
        request: &DiscoveryRequest,
        template: &crate::templates::TemplateArtifact,
        pruned_context: Value,
        instances_json: Vec<Value>,
        fingerprint: &str,
    ) -> Result<DiscoveryOutcome> {
        let mut full_context = pruned_context.as_object().cloned().unwrap_or_default();
        full_context.insert("instances".to_string(), Value::Array(instances_json));
        full_context.insert("node".to_string(), request.node.clone());
        full_context.insert(
            "requested_names".to_string(),
            Value::Array(request.requested_names.iter().cloned().map(Value::String).collect()),
        );
        full_context.insert(
            "host_header".to_string(),
            Value::String(request.host_header.clone().unwrap_or_default()),
        );

        let rendered = template.render(&Value::Object(full_context))?;
        let mut resources = extract_resources(&rendered)?;

        if !request.requested_names.is_empty() {
            resources.retain(|resource| {
                resource
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| request.requested_names.iter().any(|n| n == name))
            });
        }

        let type_url = self
            .type_url_map
            .get(&(request.resource_type.clone(), request.api_generation.clone()))
            .cloned();
        if let Some(type_url) = type_url {
            for resource in resources.iter_mut() {
                if resource.get("@type").is_none() {
                    if let Some(obj) = resource.as_object_mut() {
                        obj.insert("@type".to_string(), Value::String(type_url.clone()));
                    }
                }
            }
        }

        let response = DiscoveryResponse { version_info: fingerprint.to_string(), resources };
        let serialized =
            serde_json::to_string(&response).map_err(|e| Error::internal(format!("serialize response: {e}")))?;
        if self.cache_enabled {
            self.cache.put(fingerprint, serialized).await;
        }

        Ok(DiscoveryOutcome::Changed(response))
    }
}

fn extract_resources(rendered: &Value) -> Result<Vec<Value>> {
    match rendered {
        Value::Object(map) => match map.get("resources") {
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(_) => Err(Error::template("'resources' field must be an array")),
            None => Err(Error::template("rendered document is missing a 'resources' field")),
        },
        Value::Array(items) => Ok(items.clone()),
        _ => Err(Error::template("rendered document must be an object with 'resources' or a top-level array")),
    }
}

fn checksum_of_value(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(value).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_string(value: &Value) -> String {
    // serde_json's default (non-`preserve_order`) object map is a BTreeMap,
    // so `to_string()` already serializes object keys in sorted order.
    value.to_string()
}

/// Extract the proxy's semantic version from its node descriptor. Looks for
/// an explicit `proxy_version` field first, then a `major.minor.patch`
/// pattern inside `build_version` (the conventional Envoy-style
/// `.../1.25.3/...` string). Falls back to the literal `"default"` version
/// when neither is present, which resolves directly against the registry's
/// default template.
fn extract_proxy_version(node: &Value) -> String {
    if let Some(direct) = node.get("proxy_version").and_then(Value::as_str) {
        return direct.to_string();
    }
    if let Some(build_version) = node.get("build_version").and_then(Value::as_str) {
        let re = Regex::new(r"(\d+\.\d+\.\d+)").expect("static regex is valid");
        if let Some(captures) = re.captures(build_version) {
            return captures[1].to_string();
        }
    }
    crate::templates::DEFAULT_VERSION.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherKey, CipherSuite};
    use crate::context::TemplateContext;
    use crate::instances::{InlineSource, Instance, SourceEntry, SourcePoller};
    use crate::templates::TemplateArtifact;
    use serde_json::json;
    use std::time::Duration;

    fn build_engine(template_source: &str) -> DiscoveryEngine {
        let sources = vec![SourceEntry {
            scope: "clusters".to_string(),
            source: Arc::new(InlineSource::new(vec![Instance::new(json!({
                "name": "a",
                "service_clusters": ["T1"],
            }))])),
        }];
        let poller = Arc::new(SourcePoller::new(sources, vec![], vec![], Duration::from_secs(3600)));

        let mut templates = TemplateRegistry::new();
        templates.register("clusters", "default", TemplateArtifact::compile_tera("t", template_source).unwrap());

        let cipher = Arc::new(CipherSuite::new(vec![CipherKey::generate()], vec![]).unwrap());
        let auth = AuthGate::new(Default::default(), cipher.clone());

        DiscoveryEngine::new(
            poller,
            Arc::new(templates),
            Arc::new(TemplateContext::new()),
            Arc::new(DiscoveryCache::new(100, Duration::from_secs(60))),
            cipher,
            auth,
            MatchingConfig { enabled: true, ..Default::default() },
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    const TEMPLATE_SRC: &str = "resources:\n{% for i in instances %}  - name: {{ i.name }}\n{% endfor %}";

    async fn first_call(engine: &DiscoveryEngine) -> DiscoveryResponse {
        engine.poller.initial_load().await.unwrap();
        let request = DiscoveryRequest {
            resource_type: "clusters".to_string(),
            node: json!({"cluster": "T1", "build_version": "envoy/1.25.3/abc"}),
            requested_names: vec![],
            version_info_in: String::new(),
            host_header: None,
            api_generation: "v3".to_string(),
        };
        match engine.discover(request, None).await.unwrap() {
            DiscoveryOutcome::Changed(response) => response,
            DiscoveryOutcome::Unchanged => panic!("expected a fresh response"),
        }
    }

    #[tokio::test]
    async fn second_request_with_same_version_info_is_unchanged() {
        let engine = build_engine(TEMPLATE_SRC);
        let response = first_call(&engine).await;

        let request = DiscoveryRequest {
            resource_type: "clusters".to_string(),
            node: json!({"cluster": "T1", "build_version": "envoy/1.25.3/abc"}),
            requested_names: vec![],
            version_info_in: response.version_info.clone(),
            host_header: None,
            api_generation: "v3".to_string(),
        };
        let outcome = engine.discover(request, None).await.unwrap();
        assert!(matches!(outcome, DiscoveryOutcome::Unchanged));
    }

    #[tokio::test]
    async fn idempotent_calls_return_byte_identical_bodies() {
        let engine = build_engine(TEMPLATE_SRC);
        let first = first_call(&engine).await;

        let request = DiscoveryRequest {
            resource_type: "clusters".to_string(),
            node: json!({"cluster": "T1", "build_version": "envoy/1.25.3/abc"}),
            requested_names: vec![],
            version_info_in: "stale".to_string(),
            host_header: None,
            api_generation: "v3".to_string(),
        };
        let second = match engine.discover(request, None).await.unwrap() {
            DiscoveryOutcome::Changed(r) => r,
            DiscoveryOutcome::Unchanged => panic!("expected changed"),
        };
        assert_eq!(first.version_info, second.version_info);
        assert_eq!(serde_json::to_string(&first).unwrap(), serde_json::to_string(&second).unwrap());
    }

    #[tokio::test]
    async fn empty_requested_names_returns_all_resources() {
        let engine = build_engine(TEMPLATE_SRC);
        let response = first_call(&engine).await;
        assert_eq!(response.resources.len(), 1);
    }

    #[tokio::test]
    async fn not_configured_when_no_template_for_resource_type() {
        let engine = build_engine(TEMPLATE_SRC);
        engine.poller.initial_load().await.unwrap();
        let request = DiscoveryRequest {
            resource_type: "listeners".to_string(),
            node: json!({"cluster": "T1"}),
            requested_names: vec![],
            version_info_in: String::new(),
            host_header: None,
            api_generation: "v3".to_string(),
        };
        let err = engine.discover(request, None).await.unwrap_err();
        assert!(matches!(err, Error::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn disabled_cache_never_populates_local_tier() {
        let engine = build_engine(TEMPLATE_SRC).with_cache_enabled(false);
        first_call(&engine).await;
        let stats = engine.cache_stats().await;
        assert_eq!(stats.insertions, 0);
    }

    #[tokio::test]
    async fn version_fallback_prefers_longest_prefix() {
        let mut engine = build_engine(TEMPLATE_SRC);
        let mut templates = TemplateRegistry::new();
        templates.register("clusters", "default", TemplateArtifact::compile_tera("d", TEMPLATE_SRC).unwrap());
        templates.register(
            "clusters",
            "1.13",
            TemplateArtifact::compile_tera("s", "resources:\n  - name: from-1-13\n").unwrap(),
        );
        engine.templates = Arc::new(templates);
        engine.poller.initial_load().await.unwrap();

        let request = DiscoveryRequest {
            resource_type: "clusters".to_string(),
            node: json!({"cluster": "T1", "build_version": "envoy/1.13.7/abc"}),
            requested_names: vec![],
            version_info_in: String::new(),
            host_header: None,
            api_generation: "v3".to_string(),
        };
        let response = match engine.discover(request, None).await.unwrap() {
            DiscoveryOutcome::Changed(r) => r,
            DiscoveryOutcome::Unchanged => panic!("expected changed"),
        };
        assert_eq!(response.resources[0]["name"], "from-1-13");
    }
}
