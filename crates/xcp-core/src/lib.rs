//! Core discovery pipeline for an xDS-style configuration control plane.
//!
//! A proxy polls a [`discovery::DiscoveryEngine`] for a resource type; the
//! engine authenticates the request, selects the instances visible to the
//! calling node, renders them through a version-matched template, and
//! returns either a fresh response or an unchanged short-circuit keyed by a
//! deterministic [`fingerprint::FingerprintInputs`] hash. Everything feeding
//! that pipeline — the instance store, the template registry, the template
//! context, the discovery cache — is built from pluggable traits so a
//! deployment can swap in its own sources, loaders, and cache backends
//! without touching the engine itself.
//!
//! ```ignore
//! let engine = DiscoveryEngine::new(poller, templates, context, cache, cipher, auth, matching, type_url_map, extra_keys);
//! let outcome = engine.discover(request, Some(Duration::from_secs(5))).await?;
//! ```

pub mod admin;
pub mod auth;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod instances;
pub mod loader;
pub mod matcher;
pub mod templates;

pub use error::{Error, Result};
