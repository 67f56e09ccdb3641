//! Assembles a [`Config`] into a running [`DiscoveryEngine`] and its
//! supporting pieces: cipher suite, instance poller, template registry,
//! template context, cache, and auth gate.
//!
//! Every piece is resolved through the same [`ConfigLoaderRegistry`] a
//! deployment's own sources and templates use, so `file://`, `env://`, and
//! `https://` locations are interchangeable for keys, templates, and context
//! entries alike.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};

use xcp_core::admin::AdminSurface;
use xcp_core::auth::AuthGate;
use xcp_core::cache::DiscoveryCache;
use xcp_core::cipher::{CipherKey, CipherSuite};
use xcp_core::config::{CipherConfig, Config, ScheduleConfig};
use xcp_core::context::{RefreshSchedule, RetryPolicy, TemplateContext};
use xcp_core::discovery::DiscoveryEngine;
use xcp_core::instances::{builtin, GlobalTransform, LocationSource, PerInstanceTransform, SourceEntry, SourcePoller};
use xcp_core::loader::{parse_location_spec, ConfigLoaderRegistry, LoadedValue};
use xcp_core::templates::TemplateRegistry;
use xcp_http::HealthManager;

/// Everything `xcp-cli`'s `serve` command needs to start accepting traffic.
pub struct Bootstrapped {
    pub engine: Arc<DiscoveryEngine>,
    pub admin: Arc<AdminSurface>,
    pub health: Arc<HealthManager>,
    pub resource_types: Vec<String>,
    pub api_generations: Vec<String>,
}

/// Build every component described by `config` and run each one's initial
/// load. Returns only once the instance store and template context have
/// both successfully materialized at least once.
pub async fn bootstrap(config: &Config) -> Result<Bootstrapped> {
    let registry = Arc::new(ConfigLoaderRegistry::new());

    let cipher = build_cipher_suite(&registry, &config.cipher).await?;

    let source_entries: Vec<SourceEntry> = config
        .sources
        .iter()
        .map(|src| SourceEntry {
            scope: src.scope.clone(),
            source: Arc::new(LocationSource::new(registry.clone(), &src.protocol, &src.serialization, &src.path)),
        })
        .collect();

    let global_transforms = resolve_global_transforms(&config.global_modifiers)?;
    let per_instance_transforms = resolve_per_instance_transforms(&config.modifiers)?;

    let poller = Arc::new(
        SourcePoller::new(source_entries, global_transforms, per_instance_transforms, config.polling.refresh_rate())
            .with_circuit_threshold(config.polling.circuit_threshold),
    );
    poller.initial_load().await.context("initial instance load failed")?;

    let mut templates = TemplateRegistry::new();
    for tpl in &config.templates {
        let loaded = registry
            .load(&tpl.protocol, "template", &tpl.path)
            .await
            .with_context(|| format!("failed to load template for {}/{}", tpl.resource_type, tpl.version))?;
        templates.register(&tpl.resource_type, &tpl.version, loaded.into_template()?);
    }

    let mut resource_types: Vec<String> = config.templates.iter().map(|t| t.resource_type.clone()).collect();
    resource_types.sort();
    resource_types.dedup();

    let context = build_template_context(&registry, config).await?;

    let cache = Arc::new(build_cache(&config.discovery_cache).await?);
    let auth = AuthGate::new(config.authentication.clone(), cipher.clone());

    let mut type_url_map = BTreeMap::new();
    for mapping in &config.type_url_mappings {
        type_url_map.insert((mapping.resource_type.clone(), mapping.api_generation.clone()), mapping.type_url.clone());
    }

    let engine = Arc::new(
        DiscoveryEngine::new(
            poller,
            Arc::new(templates),
            Arc::new(context),
            cache,
            cipher,
            auth,
            config.matching.clone(),
            type_url_map,
            config.extra_fingerprint_keys.clone(),
        )
        .with_cache_enabled(config.discovery_cache.enabled),
    );
    let admin = Arc::new(AdminSurface::new(engine.clone()));

    Ok(Bootstrapped {
        engine,
        admin,
        health: Arc::new(HealthManager::with_init_timeout(Duration::from_secs(30))),
        resource_types,
        api_generations: config.api_generations.clone(),
    })
}

/// Build the discovery cache, attaching the remote tier described by
/// `discovery_cache.remote` when present. Only `kind = "redis"` is wired up,
/// and only when `xcp-core`'s `cache-redis` feature is enabled; any other
/// `kind`, or a redis remote without that feature, is rejected up front
/// rather than silently falling back to local-only.
async fn build_cache(config: &xcp_core::config::DiscoveryCacheConfig) -> Result<DiscoveryCache> {
    let cache = DiscoveryCache::new(config.max_local_entries, config.ttl());
    let Some(remote) = &config.remote else {
        return Ok(cache);
    };

    match remote.kind.as_str() {
        #[cfg(feature = "cache-redis")]
        "redis" => {
            let backend = xcp_core::cache::RedisRemoteCache::connect(
                &remote.host,
                remote.port,
                remote.password.as_deref(),
                "xcp",
            )
            .await
            .context("failed to connect to remote discovery cache")?;
            Ok(cache.with_remote(Arc::new(backend)))
        }
        #[cfg(not(feature = "cache-redis"))]
        "redis" => Err(anyhow::anyhow!(
            "discovery_cache.remote.kind = \"redis\" requires xcp-core's cache-redis feature"
        )),
        other => Err(anyhow::anyhow!("unknown discovery_cache.remote.kind: {other}")),
    }
}

fn resolve_global_transforms(names: &[String]) -> Result<Vec<Arc<dyn GlobalTransform>>> {
    names
        .iter()
        .map(|name| builtin::global(name).ok_or_else(|| anyhow::anyhow!("unknown global_modifiers entry: {name}")))
        .collect()
}

fn resolve_per_instance_transforms(names: &[String]) -> Result<Vec<Arc<dyn PerInstanceTransform>>> {
    names
        .iter()
        .map(|name| builtin::per_instance(name).ok_or_else(|| anyhow::anyhow!("unknown modifiers entry: {name}")))
        .collect()
}

async fn build_template_context(registry: &Arc<ConfigLoaderRegistry>, config: &Config) -> Result<TemplateContext> {
    let mut context = TemplateContext::new();

    for entry in &config.template_context {
        match &entry.schedule {
            None => {
                let loaded = registry
                    .load(&entry.protocol, &entry.serialization, &entry.path)
                    .await
                    .with_context(|| format!("failed to load context entry '{}'", entry.name))?;
                context.register_eager(&entry.name, loaded_to_value(loaded)?);
            }
            Some(schedule_config) => {
                let schedule = match schedule_config {
                    ScheduleConfig::IntervalSeconds(secs) => RefreshSchedule::Interval(Duration::from_secs(*secs)),
                    ScheduleConfig::Cron(expr) => RefreshSchedule::Cron(expr.clone()),
                };
                let retry = RetryPolicy { num_retries: entry.num_retries, retry_interval: entry.retry_interval() };

                let registry = registry.clone();
                let protocol = entry.protocol.clone();
                let serialization = entry.serialization.clone();
                let path = entry.path.clone();
                context.register_refreshable(&entry.name, schedule, retry, move || {
                    let registry = registry.clone();
                    let protocol = protocol.clone();
                    let serialization = serialization.clone();
                    let path = path.clone();
                    async move {
                        let loaded = registry.load(&protocol, &serialization, &path).await?;
                        loaded_to_value(loaded)
                    }
                });
            }
        }
    }

    context.initial_load().await.context("template context initial load failed")?;
    Ok(context)
}

fn loaded_to_value(loaded: LoadedValue) -> xcp_core::error::Result<serde_json::Value> {
    match loaded {
        LoadedValue::Structured(value) => Ok(value),
        LoadedValue::Text(text) => Ok(serde_json::Value::String(text)),
        LoadedValue::Template(_) => Err(xcp_core::error::Error::decode("a context entry cannot load a template")),
    }
}

async fn build_cipher_suite(registry: &ConfigLoaderRegistry, config: &CipherConfig) -> Result<Arc<CipherSuite>> {
    let mut aead_keys = Vec::new();
    for spec in &config.aead_key_specs {
        aead_keys.push(resolve_cipher_key(registry, spec).await?);
    }
    if aead_keys.is_empty() {
        tracing::warn!(
            "no cipher keys configured; generating an ephemeral key for this process. \
             authentication and encrypted context values will not survive a restart"
        );
        aead_keys.push(CipherKey::generate());
    }

    let mut legacy_keys = Vec::new();
    for spec in &config.legacy_key_specs {
        legacy_keys.push(resolve_cipher_key(registry, spec).await?);
    }

    Ok(Arc::new(CipherSuite::new(aead_keys, legacy_keys)?))
}

async fn resolve_cipher_key(registry: &ConfigLoaderRegistry, spec: &str) -> Result<CipherKey> {
    let (protocol, _serialization, path) = parse_location_spec(spec)?;
    let loaded = registry.load(&protocol, "string", &path).await?;
    decode_cipher_key(loaded.as_text()?.trim())
}

fn decode_cipher_key(text: &str) -> Result<CipherKey> {
    let bytes = if text.len() == 64 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(text).context("invalid hex-encoded cipher key")?
    } else {
        STANDARD.decode(text).context("invalid base64-encoded cipher key")?
    };
    let array: [u8; 32] =
        bytes.try_into().map_err(|_| anyhow::anyhow!("cipher key must decode to exactly 32 bytes"))?;
    Ok(CipherKey(array))
}
