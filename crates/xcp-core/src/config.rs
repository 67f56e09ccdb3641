//! Structured configuration document.
//!
//! Deserialized from YAML/JSON via the same [`crate::loader`] registry used
//! at runtime, so a deployment can point its config at `file://`, `env://`,
//! or `https://` locations interchangeably. A thin environment-variable
//! override layer runs after parsing, for the handful of settings ops teams
//! expect to flip without editing the document (log level, cache sizing,
//! debug mode).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;
use crate::error::{Error, Result};
use crate::loader::ConfigLoaderRegistry;
use crate::matcher::MatchingConfig;

/// One upstream data source feeding the instance store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Instance scope this source contributes to, e.g. `"clusters"` or
    /// `"default"`.
    pub scope: String,
    pub protocol: String,
    #[serde(default = "default_serialization")]
    pub serialization: String,
    pub path: String,
}

fn default_serialization() -> String {
    "yaml".to_string()
}

/// One registered template: where it loads from, and which
/// `(resource_type, version)` it answers for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub resource_type: String,
    #[serde(default = "default_template_version")]
    pub version: String,
    pub protocol: String,
    pub path: String,
}

fn default_template_version() -> String {
    crate::templates::DEFAULT_VERSION.to_string()
}

/// A refresh schedule in its wire form; converted to
/// [`crate::context::RefreshSchedule`] at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleConfig {
    IntervalSeconds(u64),
    Cron(String),
}

/// One template-context entry: a named value loaded once (no `schedule`) or
/// refreshed on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntryConfig {
    pub name: String,
    pub protocol: String,
    #[serde(default = "default_serialization")]
    pub serialization: String,
    pub path: String,
    pub schedule: Option<ScheduleConfig>,
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    #[serde(default = "default_retry_interval_seconds")]
    pub retry_interval_seconds: u64,
}

fn default_num_retries() -> u32 {
    3
}

fn default_retry_interval_seconds() -> u64 {
    1
}

impl ContextEntryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }
}

/// Discovery cache sizing, TTL, and optional shared remote tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryCacheConfig {
    pub enabled: bool,
    pub max_local_entries: usize,
    pub ttl_seconds: u64,
    pub remote: Option<RemoteCacheConfig>,
}

impl Default for DiscoveryCacheConfig {
    fn default() -> Self {
        Self { enabled: true, max_local_entries: 10_000, ttl_seconds: 60, remote: None }
    }
}

impl DiscoveryCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Shared key/value backend for the cache's remote tier, matching the wire
/// shape `remote: {kind, host, port, password, extra_keys?}`. `kind` selects
/// the backend implementation; only `"redis"` is currently wired, gated
/// behind the `cache-redis` feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCacheConfig {
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub extra_keys: BTreeMap<String, String>,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self { kind: "redis".to_string(), host: "127.0.0.1".to_string(), port: 6379, password: None, extra_keys: BTreeMap::new() }
    }
}

/// Source-polling cadence and the circuit-breaker threshold for consecutive
/// poll failures before escalating log severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub refresh_rate_seconds: u64,
    pub circuit_threshold: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { refresh_rate_seconds: 30, circuit_threshold: 5 }
    }
}

impl PollingConfig {
    pub fn refresh_rate(&self) -> Duration {
        Duration::from_secs(self.refresh_rate_seconds)
    }
}

/// Ambient logging configuration, consumed by `xcp-cli` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter`-compatible directive, e.g. `"info"`
    /// or `"xcp_core=debug,xcp_http=info"`.
    pub level: String,
    /// `"json"` for structured output, `"pretty"` for human-readable.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "json".to_string() }
    }
}

/// Optional external observability sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub statsd_address: Option<String>,
    pub sentry_dsn: Option<String>,
    pub tracing_enabled: bool,
    pub debug: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { statsd_address: None, sentry_dsn: None, tracing_enabled: false, debug: false }
    }
}

/// Where the cipher suite's key material comes from: each entry is a
/// `<protocol>[+<serializer>]://<path>` location spec resolving to a raw
/// 32-byte key (base64 or hex text, decoded by the bootstrap code that reads
/// this config — `xcp-core` itself stays agnostic to key encoding).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    /// At least one entry is required once authentication or any encrypted
    /// context/source value is in use; `aead_key_specs[0]` becomes the
    /// primary encrypt key.
    pub aead_key_specs: Vec<String>,
    /// Optional legacy ChaCha20-Poly1305 keys, decrypt-only.
    pub legacy_key_specs: Vec<String>,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self { aead_key_specs: Vec::new(), legacy_key_specs: Vec::new() }
    }
}

/// One `(resource_type, api_generation) -> @type URL` mapping, injected into
/// rendered resources that don't already carry an `@type` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeUrlMapping {
    pub resource_type: String,
    pub api_generation: String,
    pub type_url: String,
}

fn default_api_generations() -> Vec<String> {
    vec!["v3".to_string()]
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sources: Vec<SourceConfig>,
    /// Names of per-instance transforms to apply, resolved against
    /// [`crate::instances::builtin::per_instance`]. Runs after
    /// `global_modifiers`, in list order.
    pub modifiers: Vec<String>,
    /// Names of scope-wide transforms to apply, resolved against
    /// [`crate::instances::builtin::global`]. Runs before `modifiers`.
    pub global_modifiers: Vec<String>,
    pub matching: MatchingConfig,
    pub templates: Vec<TemplateConfig>,
    pub template_context: Vec<ContextEntryConfig>,
    pub authentication: AuthConfig,
    pub cipher: CipherConfig,
    pub discovery_cache: DiscoveryCacheConfig,
    pub polling: PollingConfig,
    /// Deployment-specific keys folded into every discovery fingerprint, in
    /// addition to the fixed input set — e.g. a cluster or region tag that
    /// should force a cache split across otherwise-identical requests.
    pub extra_fingerprint_keys: BTreeMap<String, String>,
    /// `@type` discriminator injected into rendered resources that don't
    /// already carry one.
    pub type_url_mappings: Vec<TypeUrlMapping>,
    /// API generations to mount a discovery route under, e.g. `["v2", "v3"]`.
    #[serde(default = "default_api_generations")]
    pub api_generations: Vec<String>,
    pub logging: LoggingConfig,
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            modifiers: Vec::new(),
            global_modifiers: Vec::new(),
            matching: MatchingConfig::default(),
            templates: Vec::new(),
            template_context: Vec::new(),
            authentication: AuthConfig::default(),
            cipher: CipherConfig::default(),
            discovery_cache: DiscoveryCacheConfig::default(),
            polling: PollingConfig::default(),
            extra_fingerprint_keys: BTreeMap::new(),
            type_url_mappings: Vec::new(),
            api_generations: default_api_generations(),
            logging: LoggingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Config {
    /// A copy of this configuration with every secret-bearing field
    /// replaced by a redaction marker — safe to serve from an admin
    /// endpoint.
    pub fn masked(&self) -> Config {
        let mut masked = self.clone();
        if !masked.authentication.auth_passwords.is_empty() {
            masked.authentication.auth_passwords =
                vec!["<redacted>".to_string(); masked.authentication.auth_passwords.len()];
        }
        masked.cipher.aead_key_specs = masked.cipher.aead_key_specs.iter().map(|_| "<redacted>".to_string()).collect();
        masked.cipher.legacy_key_specs =
            masked.cipher.legacy_key_specs.iter().map(|_| "<redacted>".to_string()).collect();
        if let Some(remote) = masked.discovery_cache.remote.as_mut() {
            if remote.password.is_some() {
                remote.password = Some("<redacted>".to_string());
            }
        }
        masked
    }
}

/// Load and parse the configuration document addressed by a
/// `<protocol>[+<serializer>]://<path>` location spec.
pub async fn load_config(registry: &ConfigLoaderRegistry, location_spec: &str) -> Result<Config> {
    let (protocol, serialization, path) = crate::loader::parse_location_spec(location_spec)?;
    let serialization = if serialization == "string" { "yaml".to_string() } else { serialization };
    let loaded = registry.load(&protocol, &serialization, &path).await?;
    let value = loaded.as_structured()?;
    serde_json::from_value(value.clone()).map_err(|e| Error::decode(format!("invalid configuration document: {e}")))
}

/// Environment variables consulted by [`apply_env_overrides`], each
/// overriding one leaf setting that operators commonly flip without editing
/// the document.
const ENV_LOG_LEVEL: &str = "XCP_LOG_LEVEL";
const ENV_DEBUG: &str = "XCP_DEBUG";
const ENV_CACHE_MAX_ENTRIES: &str = "XCP_DISCOVERY_CACHE_MAX_ENTRIES";
const ENV_CACHE_TTL_SECONDS: &str = "XCP_DISCOVERY_CACHE_TTL_SECONDS";

/// Apply environment-variable overrides in place. Unset variables leave the
/// parsed value untouched; malformed numeric overrides are ignored rather
/// than failing startup.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }
    if let Ok(debug) = std::env::var(ENV_DEBUG) {
        config.observability.debug = matches!(debug.as_str(), "1" | "true" | "yes");
    }
    if let Ok(max_entries) = std::env::var(ENV_CACHE_MAX_ENTRIES) {
        if let Ok(parsed) = max_entries.parse() {
            config.discovery_cache.max_local_entries = parsed;
        }
    }
    if let Ok(ttl) = std::env::var(ENV_CACHE_TTL_SECONDS) {
        if let Ok(parsed) = ttl.parse() {
            config.discovery_cache.ttl_seconds = parsed;
        }
    }
}
