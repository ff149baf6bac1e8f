//! kvpoold: the kvpool application server daemon.
//!
//! Assembles the kvpool subsystems in one process:
//! - Backend connection pool + idle reclaimer
//! - Worker dispatcher on a supervisor-provided listening socket
//! - Reload watcher (when auto-reload is enabled)
//! - Cache store garbage collection (when a cache is configured)
//!
//! # Usage
//!
//! ```text
//! kvpoold serve --config kvpool.toml --listen-fd 3
//! kvpoold serve --config kvpool.toml --bind 127.0.0.1:8800 --environment production
//! kvpoold check --config kvpool.toml
//! ```

mod relay;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use clap::{Parser, Subcommand};
use kvpool_cache::{CacheStore, spawn_gc_task};
use kvpool_conn::{BackendFactory, ConnectionPool, IdleReclaimer, PoolConfig};
use kvpool_core::{AppConfig, ResourceType, SettingsResolver};
use kvpool_dispatch::{ArtifactMtimeProbe, ProcessExit, WorkerDispatcher};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::relay::BackendRelay;

#[derive(Parser)]
#[command(name = "kvpoold", about = "kvpool application server daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept connections and serve them with pooled backend connections.
    Serve {
        /// Path to kvpool.toml.
        #[arg(long, default_value = "kvpool.toml")]
        config: PathBuf,

        /// Listening socket descriptor inherited from the supervisor.
        #[arg(long, conflicts_with = "bind")]
        listen_fd: Option<i32>,

        /// Bind a listening socket instead of inheriting one.
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Override `server.environment`.
        #[arg(long)]
        environment: Option<String>,

        /// Restart when the application artifact is rebuilt.
        #[arg(long)]
        auto_reload: bool,

        /// Backend types (driver names) that must be configured, e.g. `redis`.
        #[arg(long = "require", value_name = "TYPE")]
        required: Vec<String>,
    },
    /// Validate the configuration and print what each backend type resolves to.
    Check {
        #[arg(long, default_value = "kvpool.toml")]
        config: PathBuf,

        #[arg(long)]
        environment: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Serve {
            config,
            listen_fd,
            bind,
            environment,
            auto_reload,
            required,
        } => {
            let mut app = load_config(&config, environment)?;
            app.server.auto_reload |= auto_reload;
            require_types(&app, &required)?;
            let listener = open_listener(listen_fd, bind)?;
            run_serve(app, listener).await
        }
        Command::Check {
            config,
            environment,
        } => {
            let app = load_config(&config, environment)?;
            run_check(&app);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,kvpool=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path, environment: Option<String>) -> anyhow::Result<AppConfig> {
    let mut app = AppConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(environment) = environment {
        app.server.environment = environment;
    }
    Ok(app)
}

/// Fail unless every named type is known and configured.
fn require_types(app: &AppConfig, required: &[String]) -> anyhow::Result<()> {
    let environment = &app.server.environment;
    for name in required {
        let ty = ResourceType::from_driver_name(name)?;
        ensure!(
            app.is_available(ty, environment),
            "{ty} is required but not configured for environment '{environment}'"
        );
    }
    Ok(())
}

fn open_listener(
    listen_fd: Option<i32>,
    bind: Option<SocketAddr>,
) -> anyhow::Result<std::net::TcpListener> {
    match (listen_fd, bind) {
        (Some(fd), _) => listener_from_fd(fd),
        (None, Some(addr)) => {
            std::net::TcpListener::bind(addr).with_context(|| format!("binding {addr}"))
        }
        (None, None) => bail!("either --listen-fd or --bind is required"),
    }
}

#[cfg(unix)]
fn listener_from_fd(fd: i32) -> anyhow::Result<std::net::TcpListener> {
    use std::os::fd::FromRawFd;

    ensure!(fd > 0, "invalid listening socket descriptor: {fd}");
    // SAFETY: the supervisor passes ownership of an open listening socket;
    // nothing else in this process uses the descriptor.
    Ok(unsafe { std::net::TcpListener::from_raw_fd(fd) })
}

#[cfg(not(unix))]
fn listener_from_fd(_fd: i32) -> anyhow::Result<std::net::TcpListener> {
    bail!("--listen-fd is only supported on unix")
}

async fn run_serve(app: AppConfig, listener: std::net::TcpListener) -> anyhow::Result<()> {
    let environment = app.server.environment.clone();
    let max_workers = app.server.max_workers();
    info!(%environment, max_workers, "kvpool daemon starting");

    // ── Connection pool ────────────────────────────────────────

    let resolver: Arc<dyn SettingsResolver> = Arc::new(app.clone());
    let pool = Arc::new(ConnectionPool::new(
        PoolConfig::from_app_config(&app),
        resolver,
        Arc::new(BackendFactory::default()),
    ));
    let available = pool.available_types();
    if available.is_empty() {
        warn!(%environment, "no backend configured, requests will be echoed");
    } else {
        info!(?available, "connection pool initialized");
    }
    let reclaimer = IdleReclaimer::spawn(Arc::clone(&pool));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Cache store ────────────────────────────────────────────

    let gc_handle = match &app.cache {
        Some(cache) => {
            let store = CacheStore::from_config(cache)
                .with_context(|| format!("opening cache store {}", cache.path.display()))?;
            let period = Duration::from_secs(cache.gc_interval_secs.max(1));
            info!(path = ?cache.path, ?period, "cache store opened");
            Some(spawn_gc_task(store, period, shutdown_rx.clone()))
        }
        None => None,
    };

    // ── Dispatcher ─────────────────────────────────────────────

    let mut dispatcher = WorkerDispatcher::new(max_workers, BackendRelay::new(Arc::clone(&pool)));
    if let Some(artifact) = &app.server.artifact {
        dispatcher =
            dispatcher.with_reload(Arc::new(ArtifactMtimeProbe::new(artifact)), Arc::new(ProcessExit));
    }
    dispatcher.set_auto_reload(app.server.auto_reload);
    dispatcher.start(listener)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");

    // Drain requests before the pool goes away under them.
    dispatcher.stop().await;
    reclaimer.stop().await;
    let _ = shutdown_tx.send(true);
    if let Some(handle) = gc_handle {
        let _ = handle.await;
    }

    pool.log_stats();
    pool.shutdown();

    info!("kvpool daemon stopped");
    Ok(())
}

fn run_check(app: &AppConfig) {
    let environment = &app.server.environment;
    println!("environment: {environment}");
    println!("workers:     {}", app.server.max_workers());
    for ty in ResourceType::ALL {
        if !app.is_available(ty, environment) {
            println!("{:<8} not configured", ty.driver_name());
            continue;
        }
        match app.resolve(ty, environment) {
            Ok(settings) => println!("{:<8} {}", ty.driver_name(), settings.address(ty)),
            Err(e) => println!("{:<8} invalid: {e}", ty.driver_name()),
        }
    }
    match &app.cache {
        Some(cache) => println!(
            "cache    {} (threshold {} bytes)",
            cache.path.display(),
            cache.threshold_file_size
        ),
        None => println!("cache    disabled"),
    }
}
