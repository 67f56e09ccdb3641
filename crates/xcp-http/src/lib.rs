//! # xcp-http
//!
//! HTTP transport for the discovery control plane: the proxy-facing
//! discovery endpoint, the admin/introspection API, and Kubernetes-style
//! health probes, all built on [`axum`].
//!
//! ## Overview
//!
//! This crate never implements discovery logic itself — every handler is a
//! thin JSON adapter over [`xcp_core::discovery::DiscoveryEngine`] and
//! [`xcp_core::admin::AdminSurface`]. That keeps there from being two
//! rendering paths: an admin "fetch this resource" request goes through the
//! exact same auth, matcher, and template pipeline a proxy's discovery
//! request would.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xcp_http::{build_router, RouterConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = build_router(RouterConfig {
//!         engine: engine.clone(),
//!         admin: Arc::new(admin_surface),
//!         config: Arc::new(effective_config),
//!         health: health_manager.clone(),
//!         resource_types: vec!["clusters".into(), "listeners".into()],
//!         api_generations: vec!["v2".to_string(), "v3".to_string()],
//!         version: env!("CARGO_PKG_VERSION"),
//!     });
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:18000").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod admin_routes;
pub mod discovery_routes;
pub mod error;
pub mod health;

pub use error::ApiError;
pub use health::{HealthManager, ServiceStatus};

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use xcp_core::admin::AdminSurface;
use xcp_core::config::Config;
use xcp_core::discovery::DiscoveryEngine;

use admin_routes::AdminState;
use discovery_routes::{discovery_router_for_all, DiscoveryState, NoChangeStatus};

/// Everything [`build_router`] needs to assemble the full HTTP surface.
pub struct RouterConfig {
    pub engine: Arc<DiscoveryEngine>,
    pub admin: Arc<AdminSurface>,
    pub config: Arc<Config>,
    pub health: Arc<HealthManager>,
    /// Resource types to mount a discovery route for, e.g. `["clusters",
    /// "listeners", "routes", "endpoints"]`.
    pub resource_types: Vec<String>,
    /// API generations to mount each resource type under, e.g. `["v2",
    /// "v3"]`.
    pub api_generations: Vec<String>,
    pub request_deadline: Option<Duration>,
    pub version: &'static str,
}

/// Build the full HTTP router: discovery routes for every configured
/// `(api_generation, resource_type)` pair, the admin API, and health
/// probes.
pub fn build_router(config: RouterConfig) -> Router {
    let mut app = Router::new().merge(health::health_router(config.health));

    for api_generation in &config.api_generations {
        let discovery_state = DiscoveryState {
            engine: config.engine.clone(),
            no_change_status: NoChangeStatus::default(),
            request_deadline: config.request_deadline,
            api_generation: api_generation.clone(),
            server_version: config.version,
        };
        app = app.merge(discovery_router_for_all(discovery_state, &config.resource_types));
    }

    let admin_state =
        AdminState { admin: config.admin.clone(), config: config.config.clone(), version: config.version };
    app = app.merge(admin_routes::admin_router(admin_state));

    // Admin read-only endpoints are intended for operator tooling and the
    // browser UI (§1 scope exclusion), both of which may run off-origin.
    app.layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive())
}
