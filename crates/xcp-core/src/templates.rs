//! Template registry: `(proxy_version, resource_type) -> template_artifact`.
//!
//! Two template kinds are supported (design note §9): a Tera text template
//! that produces a document to be parsed, and a native Rust closure that is
//! invoked directly — the hot-path kind used to sidestep render+parse
//! overhead. Both share [`TemplateArtifact`], which carries the checksum
//! used as part of the request fingerprint and the free-identifier set used
//! to prune the template context.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Identifier reserved for the proxy-version-agnostic fallback template.
pub const DEFAULT_VERSION: &str = "default";

static TEMPLATE_VAR_RE_SRC: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)";

fn extract_free_identifiers(source: &str) -> BTreeSet<String> {
    let re = Regex::new(TEMPLATE_VAR_RE_SRC).expect("static regex is valid");
    re.captures_iter(source).map(|cap| cap[1].to_string()).collect()
}

fn checksum_of(source: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source);
    hex::encode(hasher.finalize())
}

/// A compiled template: either a Tera text template or a native closure.
#[derive(Clone)]
pub enum CompiledForm {
    Tera { engine: Arc<tera::Tera>, name: String },
    Native(Arc<dyn Fn(&serde_json::Value) -> Result<serde_json::Value> + Send + Sync>),
}

impl std::fmt::Debug for CompiledForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tera { name, .. } => write!(f, "CompiledForm::Tera({name})"),
            Self::Native(_) => write!(f, "CompiledForm::Native(..)"),
        }
    }
}

/// A registered template artifact: compiled form plus the metadata needed
/// by the discovery engine and the admin surface.
#[derive(Debug, Clone)]
pub struct TemplateArtifact {
    pub compiled: CompiledForm,
    pub source: String,
    pub checksum: String,
    pub free_identifiers: BTreeSet<String>,
}

impl TemplateArtifact {
    /// Compile a Tera text template. The rendered output is expected to be
    /// a YAML or JSON document, parsed by the discovery engine after
    /// render.
    pub fn compile_tera(name: &str, source: &str) -> Result<Self> {
        let mut engine = tera::Tera::default();
        engine
            .add_raw_template(name, source)
            .map_err(|e| Error::template(format!("failed to compile template {name}: {e}")))?;

        Ok(Self {
            compiled: CompiledForm::Tera { engine: Arc::new(engine), name: name.to_string() },
            source: source.to_string(),
            checksum: checksum_of(source.as_bytes()),
            free_identifiers: extract_free_identifiers(source),
        })
    }

    /// Wrap a native closure as a template artifact. `free_identifiers`
    /// must be supplied explicitly since there is no source to parse.
    pub fn native<F>(descriptive_source: &str, free_identifiers: BTreeSet<String>, f: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        Self {
            compiled: CompiledForm::Native(Arc::new(f)),
            source: descriptive_source.to_string(),
            checksum: checksum_of(descriptive_source.as_bytes()),
            free_identifiers,
        }
    }

    /// Render this template against a context, returning a parsed JSON
    /// value. Tera templates render to text and are then parsed as
    /// YAML/JSON; native templates produce structured data directly.
    pub fn render(&self, context: &serde_json::Value) -> Result<serde_json::Value> {
        match &self.compiled {
            CompiledForm::Tera { engine, name } => {
                let tera_context = tera::Context::from_serialize(context)
                    .map_err(|e| Error::template(format!("invalid context: {e}")))?;
                let rendered = engine
                    .render(name, &tera_context)
                    .map_err(|e| Error::template(format!("render failed: {e}")))?;
                serde_yaml::from_str(&rendered)
                    .map_err(|e| Error::template(format!("rendered output is not valid YAML/JSON: {e}")))
            }
            CompiledForm::Native(f) => f(context),
        }
    }

    /// Whether this artifact passes rendered output straight through as
    /// structured data (native closures) rather than text to be parsed.
    pub fn is_pass_through(&self) -> bool {
        matches!(self.compiled, CompiledForm::Native(_))
    }
}

/// Registry of template artifacts keyed by `(resource_type, proxy_version)`.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    by_resource_type: HashMap<String, BTreeMap<String, TemplateArtifact>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template for a resource type under a specific version, or
    /// under [`DEFAULT_VERSION`] as the fallback for all unmatched
    /// versions.
    pub fn register(&mut self, resource_type: &str, version: &str, artifact: TemplateArtifact) {
        self.by_resource_type
            .entry(resource_type.to_string())
            .or_default()
            .insert(version.to_string(), artifact);
    }

    /// Resolve the template for `(version, resource_type)`: exact match
    /// first, then the longest configured dotted-component prefix, then
    /// [`DEFAULT_VERSION`].
    pub fn for_request(&self, version: &str, resource_type: &str) -> Result<&TemplateArtifact> {
        let versions = self.by_resource_type.get(resource_type).ok_or_else(|| {
            Error::NotConfigured {
                resource_type: resource_type.to_string(),
                version: version.to_string(),
            }
        })?;

        if let Some(exact) = versions.get(version) {
            return Ok(exact);
        }

        let requested: Vec<&str> = version.split('.').collect();
        let mut best: Option<(usize, &TemplateArtifact)> = None;

        for (key, artifact) in versions {
            if key == DEFAULT_VERSION {
                continue;
            }
            let key_parts: Vec<&str> = key.split('.').collect();
            if key_parts.len() > requested.len() {
                continue;
            }
            let matched = key_parts.iter().zip(requested.iter()).take_while(|(a, b)| a == b).count();
            if matched == key_parts.len() && matched > best.as_ref().map(|(n, _)| *n).unwrap_or(0) {
                best = Some((matched, artifact));
            }
        }

        if let Some((_, artifact)) = best {
            return Ok(artifact);
        }

        versions.get(DEFAULT_VERSION).ok_or_else(|| Error::NotConfigured {
            resource_type: resource_type.to_string(),
            version: version.to_string(),
        })
    }

    /// List the resource types registered for a given (exact) version, used
    /// by the admin surface.
    pub fn resource_types_for_version(&self, version: &str) -> Vec<String> {
        self.by_resource_type
            .iter()
            .filter(|(_, versions)| {
                versions.contains_key(version) || versions.contains_key(DEFAULT_VERSION)
            })
            .map(|(rt, _)| rt.clone())
            .collect()
    }

    /// All `(resource_type, version)` pairs, for the admin deep-check.
    pub fn all_pairs(&self) -> Vec<(String, String)> {
        self.by_resource_type
            .iter()
            .flat_map(|(rt, versions)| versions.keys().map(move |v| (rt.clone(), v.clone())))
            .collect()
    }

    /// Look up a template by its exact registered key, with no fallback
    /// resolution. Used by the admin surface to dump per-template metadata.
    pub fn get_exact(&self, resource_type: &str, version: &str) -> Option<&TemplateArtifact> {
        self.by_resource_type.get(resource_type)?.get(version)
    }
}
