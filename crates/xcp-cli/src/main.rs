//! `xcp`: the discovery control plane binary.
//!
//! Loads configuration, bootstraps the discovery engine, and serves the
//! proxy-facing discovery API, the admin API, and health probes over HTTP.

mod bootstrap;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use xcp_core::admin::AdminSurface;
use xcp_core::config::{apply_env_overrides, load_config, Config, LoggingConfig};
use xcp_core::loader::ConfigLoaderRegistry;
use xcp_http::{build_router, HealthManager, RouterConfig};

#[derive(Parser)]
#[command(name = "xcp")]
#[command(about = "xDS-style discovery control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load configuration, bootstrap the discovery engine, and serve.
    Serve(ServeArgs),
    /// Load configuration and run the full bootstrap without serving —
    /// catches bad sources, templates, and cipher keys before a rollout.
    Validate(ValidateArgs),
    /// Print a freshly generated 256-bit cipher key, hex-encoded.
    GenerateKey,
}

#[derive(Args)]
struct ServeArgs {
    /// Configuration location spec, e.g. `file+yaml:///etc/xcp/config.yaml`.
    #[arg(short, long, env = "XCP_CONFIG", default_value = "file+yaml://config.yaml")]
    config: String,

    /// Address to bind the HTTP listener to.
    #[arg(long, env = "XCP_BIND", default_value = "0.0.0.0:18000")]
    bind: String,

    /// Per-request deadline in seconds for the discovery pipeline.
    #[arg(long, env = "XCP_REQUEST_DEADLINE_SECONDS", default_value_t = 5)]
    request_deadline_seconds: u64,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(short, long, env = "XCP_CONFIG", default_value = "file+yaml://config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateKey => {
            println!("{}", AdminSurface::generate_key_hex());
            Ok(())
        }
        Command::Validate(args) => run_validate(&args).await,
        Command::Serve(args) => run_serve(&args).await,
    }
}

async fn load_effective_config(location_spec: &str) -> Result<Config> {
    let registry = ConfigLoaderRegistry::new();
    let mut config =
        load_config(&registry, location_spec).await.with_context(|| format!("failed to load config from {location_spec}"))?;
    apply_env_overrides(&mut config);
    Ok(config)
}

async fn run_validate(args: &ValidateArgs) -> Result<()> {
    let config = load_effective_config(&args.config).await?;
    init_logging(&config.logging);
    bootstrap::bootstrap(&config).await.context("bootstrap failed")?;
    tracing::info!(config = %args.config, "configuration is valid");
    Ok(())
}

async fn run_serve(args: &ServeArgs) -> Result<()> {
    let config = load_effective_config(&args.config).await?;
    init_logging(&config.logging);
    xcp_http::error::set_debug(config.observability.debug);
    tracing::info!(config = %args.config, bind = %args.bind, "starting xcp");

    let bootstrapped = match bootstrap::bootstrap(&config).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "bootstrap failed");
            return Err(e);
        }
    };

    let poller = bootstrapped.engine.poller().clone();
    tokio::spawn(poller.run());

    let context = bootstrapped.engine.context().clone();
    let _context_schedulers = context.spawn_schedulers();

    bootstrapped.health.set_ready().await;

    let router = build_router(RouterConfig {
        engine: bootstrapped.engine.clone(),
        admin: bootstrapped.admin.clone(),
        config: std::sync::Arc::new(config),
        health: bootstrapped.health.clone(),
        resource_types: bootstrapped.resource_types,
        api_generations: bootstrapped.api_generations,
        request_deadline: Some(Duration::from_secs(args.request_deadline_seconds)),
        version: env!("CARGO_PKG_VERSION"),
    });

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(addr = %args.bind, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(bootstrapped.health.clone()))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(health: std::sync::Arc<HealthManager>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    health.set_shutting_down().await;
}

fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    if config.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
