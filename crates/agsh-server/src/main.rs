//! agsh-server binary: config, wiring, and the serve loop.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use agsh_core::WorkerRouter;
use agsh_server::config::ServerConfig;
use agsh_server::http::{app, AppState};
use agsh_server::session::{IdleReaper, SessionRegistry};
use agsh_server::workspace::WorkspaceLayout;

/// agsh-server — Agent Shell session worker
#[derive(Parser, Debug)]
#[command(name = "agsh-server", version, about = "Agent Shell session worker")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.agsh/config.toml")]
    config: String,

    /// Workspaces root directory
    #[arg(long)]
    workspaces_dir: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Idle timeout in seconds for unattended sessions (0 disables reaping)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Identity assumed when the proxy header is absent (development only)
    #[arg(long)]
    dev_user: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting agsh-server");

    let config = match ServerConfig::load(
        Some(Path::new(&cli.config)),
        cli.port,
        cli.workspaces_dir.as_deref(),
        cli.max_sessions,
        cli.idle_timeout,
        cli.dev_user.as_deref(),
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(SessionRegistry::new(
        config.session_limits(),
        config.spawn_spec(),
        WorkspaceLayout::new(config.workspaces_dir.clone()),
    ));

    let reaper = IdleReaper::new(
        registry.clone(),
        config.sweep_interval(),
        config.idle_threshold(),
    );
    let reaper_handle = reaper.spawn();

    let router = Arc::new(WorkerRouter::new(
        config.routing.workers.clone(),
        config.routing.strategy,
        config.routing.virtual_nodes,
    ));
    if !router.is_empty() {
        info!(
            workers = router.len(),
            strategy = ?config.routing.strategy,
            "worker fleet configured"
        );
    }

    let state = AppState {
        registry: registry.clone(),
        router,
        dev_fallback_user: config.dev_fallback_user.clone(),
    };

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(
        addr = %addr,
        command = %config.spawn.command,
        max_sessions = config.sessions.max_sessions,
        "agsh-server ready"
    );

    if let Err(e) = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
    }

    // Drain: kill every session before the process exits.
    reaper_handle.abort();
    registry.shutdown().await;
    info!("shutdown complete");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
