//! Config loader registry: resolves `(protocol, serialization, path)`
//! references into typed values.
//!
//! Protocol and serializer implementations are plugin points. Built-ins
//! cover `file`, `env`, `inline`, `http`/`https` protocols and
//! `yaml`/`json`/`string`/`template` serializations. Additional protocols
//! register through [`ConfigLoaderRegistry::register_protocol`] — there is
//! no reflective discovery, matching the explicit-registration design
//! called for when a code-execution loader (which this build omits) would
//! otherwise need sandboxing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::templates::TemplateArtifact;

/// A value resolved by the loader registry.
#[derive(Debug, Clone)]
pub enum LoadedValue {
    /// A structured document (parsed YAML or JSON).
    Structured(serde_json::Value),
    /// Raw text, passed through unparsed.
    Text(String),
    /// A compiled template, ready for the template registry.
    Template(TemplateArtifact),
}

impl LoadedValue {
    pub fn as_structured(&self) -> Result<&serde_json::Value> {
        match self {
            Self::Structured(v) => Ok(v),
            _ => Err(Error::decode("expected a structured document")),
        }
    }

    pub fn as_text(&self) -> Result<&str> {
        match self {
            Self::Text(s) => Ok(s),
            _ => Err(Error::decode("expected raw text")),
        }
    }

    pub fn into_template(self) -> Result<TemplateArtifact> {
        match self {
            Self::Template(t) => Ok(t),
            _ => Err(Error::decode("expected a compiled template")),
        }
    }
}

/// A pluggable protocol: knows how to fetch raw bytes for a `path`.
#[async_trait]
pub trait LoaderProtocol: Send + Sync {
    /// Unique protocol name, e.g. `"file"`.
    fn name(&self) -> &'static str;

    /// Fetch the raw bytes addressed by `path` under this protocol.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>>;
}

struct FileProtocol;

#[async_trait]
impl LoaderProtocol for FileProtocol {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(Error::Io)
    }
}

struct EnvProtocol;

#[async_trait]
impl LoaderProtocol for EnvProtocol {
    fn name(&self) -> &'static str {
        "env"
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        std::env::var(path)
            .map(|v| v.into_bytes())
            .map_err(|_| Error::bad_location(format!("environment variable not set: {path}")))
    }
}

struct InlineProtocol;

#[async_trait]
impl LoaderProtocol for InlineProtocol {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        // For the inline protocol, `path` carries the literal value itself.
        Ok(path.as_bytes().to_vec())
    }
}

struct HttpProtocol {
    client: reqwest::Client,
}

#[async_trait]
impl LoaderProtocol for HttpProtocol {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        debug!(url = %path, "fetching config value over http");
        let response = self.client.get(path).send().await?;
        let bytes = response.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Registry of loader protocols plus the fixed set of serializations.
pub struct ConfigLoaderRegistry {
    protocols: HashMap<String, Arc<dyn LoaderProtocol>>,
}

impl Default for ConfigLoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoaderRegistry {
    /// Build a registry with the built-in protocols registered.
    pub fn new() -> Self {
        let mut registry = Self { protocols: HashMap::new() };
        registry.register_protocol(Arc::new(FileProtocol)).expect("built-in name collision");
        registry.register_protocol(Arc::new(EnvProtocol)).expect("built-in name collision");
        registry.register_protocol(Arc::new(InlineProtocol)).expect("built-in name collision");
        let http = Arc::new(HttpProtocol { client: reqwest::Client::new() });
        registry.register_protocol(http.clone()).expect("built-in name collision");
        registry
            .protocols
            .insert("https".to_string(), http);
        registry
    }

    /// Register an additional protocol implementation. Fails if the name is
    /// already taken.
    pub fn register_protocol(&mut self, loader: Arc<dyn LoaderProtocol>) -> Result<()> {
        let name = loader.name().to_string();
        if self.protocols.contains_key(&name) {
            return Err(Error::internal(format!("protocol already registered: {name}")));
        }
        self.protocols.insert(name, loader);
        Ok(())
    }

    /// Resolve a `(protocol, serialization, path)` reference.
    pub async fn load(&self, protocol: &str, serialization: &str, path: &str) -> Result<LoadedValue> {
        let loader = self
            .protocols
            .get(protocol)
            .ok_or_else(|| Error::bad_location(format!("unknown protocol: {protocol}")))?;
        let bytes = loader.fetch(path).await?;

        match serialization {
            "yaml" => {
                let value: serde_json::Value = serde_yaml::from_slice(&bytes)?;
                Ok(LoadedValue::Structured(value))
            }
            "json" => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)?;
                Ok(LoadedValue::Structured(value))
            }
            "string" => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| Error::decode(format!("non-utf8 content: {e}")))?;
                Ok(LoadedValue::Text(text))
            }
            "template" => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| Error::decode(format!("non-utf8 template source: {e}")))?;
                let artifact = TemplateArtifact::compile_tera(path, &text)?;
                Ok(LoadedValue::Template(artifact))
            }
            other => Err(Error::bad_location(format!("unknown serialization: {other}"))),
        }
    }
}

/// Parse a compact `<protocol>[+<serializer>]://<path>` location spec into
/// its three parts, defaulting the serializer to `"string"` when omitted.
pub fn parse_location_spec(spec: &str) -> Result<(String, String, String)> {
    let (scheme, path) = spec
        .split_once("://")
        .ok_or_else(|| Error::bad_location(format!("malformed location spec: {spec}")))?;

    let (protocol, serialization) = match scheme.split_once('+') {
        Some((p, s)) => (p.to_string(), s.to_string()),
        None => (scheme.to_string(), "string".to_string()),
    };

    Ok((protocol, serialization, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inline_protocol_round_trips_raw_value() {
        let registry = ConfigLoaderRegistry::new();
        let loaded = registry.load("inline", "string", "hello").await.unwrap();
        assert_eq!(loaded.as_text().unwrap(), "hello");
    }

    #[tokio::test]
    async fn inline_yaml_parses_structured_document() {
        let registry = ConfigLoaderRegistry::new();
        let loaded = registry.load("inline", "yaml", "a: 1\nb: [2, 3]").await.unwrap();
        let value = loaded.as_structured().unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"][1], 3);
    }

    #[tokio::test]
    async fn unknown_protocol_is_bad_location() {
        let registry = ConfigLoaderRegistry::new();
        let err = registry.load("s3", "string", "bucket/key").await.unwrap_err();
        assert!(matches!(err, Error::BadLocation(_)));
    }

    #[test]
    fn parses_compact_location_spec() {
        let (p, s, path) = parse_location_spec("file+yaml:///etc/xcp/config.yaml").unwrap();
        assert_eq!(p, "file");
        assert_eq!(s, "yaml");
        assert_eq!(path, "/etc/xcp/config.yaml");
    }

    #[test]
    fn defaults_serializer_to_string() {
        let (p, s, path) = parse_location_spec("env://MY_VAR").unwrap();
        assert_eq!(p, "env");
        assert_eq!(s, "string");
        assert_eq!(path, "MY_VAR");
    }
}
