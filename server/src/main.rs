//! Outreach Dispatch Server
//!
//! The dispatch server paces multi-tenant direct-message campaigns: it
//! leases campaign leads to online senders under daily quotas and
//! human-plausible timing, hands each lease to a remote browser agent as a
//! single task, and reconciles the reported outcome into per-lead,
//! per-sender, and per-campaign state.
// This is the main entry point for the server application. It's responsible for:
// - Initializing logging and configuration.
// - Setting up the main `Server` struct.
// - Starting the scheduler loop and the HTTP/WebSocket surface.
// - Handling graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod config;
mod eligibility;
mod lease;
mod pacing;
mod reconcile;
mod registry;
mod scheduler;
mod store;
mod streak;
mod ws;

#[cfg(test)]
mod tests;

use config::ConfigManager;
use registry::AgentRegistry;
use scheduler::Scheduler;
use store::Store;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Dispatch server for outbound messaging campaigns", long_about = None)]
struct CliArgs {
    /// Path to the server configuration file (server.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,
}

/// The main application structure for the server. It owns the configuration,
/// the store, the agent registry, and the background task handles.
pub struct Server {
    /// The configuration manager, responsible for loading server settings.
    config_manager: ConfigManager,
    /// The `SocketAddr` (IP address and port) on which the server listens.
    listen_address: SocketAddr,
    /// Durable store handle, shared with handlers and the scheduler.
    store: Option<Arc<Mutex<Store>>>,
    /// Handle to the scheduler loop for graceful shutdown.
    scheduler_task_handle: Option<JoinHandle<()>>,
    /// Handle to the retention cleanup task for graceful shutdown.
    cleanup_task_handle: Option<JoinHandle<()>>,
    /// Handle to the WAL checkpoint task for graceful shutdown.
    wal_checkpoint_task_handle: Option<JoinHandle<()>>,
    /// Shutdown signal sender for notifying background tasks.
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Server {
    /// Creates a new server instance from a configuration path.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_manager = ConfigManager::new(config_path)?;
        let server_config = config_manager
            .server_config
            .as_ref()
            .expect("Server configuration not loaded. This should not happen as config is loaded in new().");

        let listen_address: SocketAddr = server_config.listen_address.parse().map_err(|e| {
            anyhow::anyhow!(
                "Invalid listen address '{}': {}",
                server_config.listen_address,
                e
            )
        })?;

        Ok(Self {
            config_manager,
            listen_address,
            store: None,
            scheduler_task_handle: None,
            cleanup_task_handle: None,
            wal_checkpoint_task_handle: None,
            shutdown_tx: None,
        })
    }

    /// Starts the server and runs until the HTTP listener stops.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Outreach Dispatch Server");

        let server_config = Arc::new(
            self.config_manager
                .server_config
                .clone()
                .expect("Server configuration not loaded. This should not happen as config is loaded in new()."),
        );

        info!(
            listen_address = %self.listen_address,
            tick_interval = server_config.tick_interval_seconds,
            data_dir = %server_config.data_dir,
            "Server configuration loaded"
        );

        // Initialize the store
        info!("Initializing store");
        let mut store = Store::new(&server_config.data_dir).context("Failed to create store")?;
        store.initialize().await.context("Failed to initialize store")?;
        let store = Arc::new(Mutex::new(store));
        self.store = Some(Arc::clone(&store));
        info!("Store initialized successfully");

        let registry = AgentRegistry::new();
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            registry.clone(),
            Arc::clone(&server_config),
        ));

        // Create shutdown broadcast channel
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Start the scheduler loop. The loop body awaits the whole tick, so
        // ticks never overlap; missed fires are skipped.
        let tick_scheduler = Arc::clone(&scheduler);
        let tick_interval_seconds = server_config.tick_interval_seconds;
        let mut scheduler_shutdown_rx = shutdown_tx.subscribe();
        let scheduler_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                tick_interval_seconds,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = tick_scheduler.run_tick().await {
                            error!("Scheduler tick failed: {}", e);
                        }
                    }
                    _ = scheduler_shutdown_rx.recv() => {
                        info!("Scheduler task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.scheduler_task_handle = Some(scheduler_task);
        info!(
            "Scheduler loop started (tick interval: {}s)",
            tick_interval_seconds
        );

        // Application state for the HTTP surface
        let app_state = api::AppState::new(
            Arc::clone(&server_config),
            Arc::clone(&store),
            registry.clone(),
            Arc::clone(&scheduler),
        );

        // Start periodic retention cleanup task
        let cleanup_interval_hours = server_config.cleanup_interval_hours;
        let retention_days = server_config.data_retention_days;
        let initial_cleanup_delay = server_config.initial_cleanup_delay_seconds;
        let db_for_cleanup = Arc::clone(&store);
        let rate_limiter_for_cleanup = app_state.rate_limiter.clone();
        let mut cleanup_shutdown_rx = shutdown_tx.subscribe();
        let cleanup_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                u64::from(cleanup_interval_hours) * 3600,
            ));

            // Run first cleanup after configured initial delay
            tokio::time::sleep(std::time::Duration::from_secs(initial_cleanup_delay)).await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!("Running periodic retention cleanup");
                        let now = shared::current_timestamp();
                        let mut db = db_for_cleanup.lock().await;
                        if let Err(e) = db.cleanup_old_data(retention_days, now).await {
                            error!("Retention cleanup failed: {}", e);
                        }
                        drop(db);
                        rate_limiter_for_cleanup.cleanup_stale_entries().await;
                    }
                    _ = cleanup_shutdown_rx.recv() => {
                        info!("Cleanup task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.cleanup_task_handle = Some(cleanup_task);

        // Start periodic WAL checkpoint task
        let wal_checkpoint_interval_secs = server_config.wal_checkpoint_interval_seconds;
        let db_for_wal = Arc::clone(&store);
        let mut wal_shutdown_rx = shutdown_tx.subscribe();
        let wal_checkpoint_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                wal_checkpoint_interval_secs,
            ));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let mut db = db_for_wal.lock().await;
                        match db.checkpoint_wal().await {
                            Ok(frames) => {
                                if frames > 0 {
                                    info!("WAL checkpoint completed: {} frames checkpointed", frames);
                                }
                            }
                            Err(e) => {
                                warn!("WAL checkpoint failed: {}", e);
                            }
                        }
                    }
                    _ = wal_shutdown_rx.recv() => {
                        info!("WAL checkpoint task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.wal_checkpoint_task_handle = Some(wal_checkpoint_task);

        // Set up the REST + WebSocket surface
        let app = api::create_router(app_state);

        info!("Starting HTTP server on {}", self.listen_address);

        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind TCP listener to {}. \
                     Check if port is already in use (EADDRINUSE) or requires elevated permissions (EACCES).",
                    self.listen_address
                )
            })?;

        // Create a shutdown signal receiver for axum
        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    /// Performs a graceful shutdown of the server.
    ///
    /// Shutdown sequence:
    /// 1. Broadcast shutdown signal to all background tasks
    /// 2. Wait for the scheduler and maintenance tasks (bounded by timeout)
    /// 3. Close the store connection
    pub async fn shutdown(&mut self) {
        info!("Shutting down Outreach Dispatch Server gracefully");

        let shutdown_timeout_secs = self
            .config_manager
            .server_config
            .as_ref()
            .map(|c| c.graceful_shutdown_timeout_seconds)
            .unwrap_or(30);

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        for (name, handle) in [
            ("scheduler", self.scheduler_task_handle.take()),
            ("cleanup", self.cleanup_task_handle.take()),
            ("WAL checkpoint", self.wal_checkpoint_task_handle.take()),
        ] {
            let Some(handle) = handle else { continue };
            info!(
                "Waiting for {} task to complete (timeout: {}s)",
                name, shutdown_timeout_secs
            );
            match tokio::time::timeout(
                std::time::Duration::from_secs(shutdown_timeout_secs),
                handle,
            )
            .await
            {
                Ok(Ok(())) => info!("{} task completed successfully", name),
                Ok(Err(e)) => warn!("{} task panicked: {}", name, e),
                Err(_) => warn!("{} task shutdown timeout reached, aborting", name),
            }
        }

        if let Some(store) = &self.store {
            info!("Closing store connection");
            let mut store = store.lock().await;
            store.close().await;
            info!("Store connection closed");
        }

        info!("Server shutdown complete");
    }
}

/// Sets up signal handlers for graceful shutdown.
/// Returns a future that completes when a shutdown signal is received.
///
/// On Unix systems, handles SIGTERM and SIGINT signals.
/// On non-Unix systems, handles Ctrl+C.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                error!("Falling back to Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

/// Server entry point
///
/// Initializes logging, loads configuration, creates the server instance,
/// and runs until a shutdown signal is received.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    let file_appender = tracing_appender::rolling::daily("./logs", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Configure logging with proper RUST_LOG environment variable handling
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    // Parse command-line arguments
    let cli_args = CliArgs::parse();

    info!("Outreach Dispatch Server starting up");
    info!("Configuration file: {}", cli_args.config_file.display());

    if cli_args.listen_address.is_some() {
        info!("Listen address override provided via command line");
    }
    if cli_args.api_key.is_some() {
        info!("API key override provided via command line");
    }

    // Create and initialize the server. Exit if initialization fails.
    let mut server = match Server::new(cli_args.config_file) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    // Apply command-line overrides if provided
    if cli_args.listen_address.is_some() || cli_args.api_key.is_some() {
        let changed = match server
            .config_manager
            .override_and_persist_config(cli_args.listen_address, cli_args.api_key)
        {
            Ok(changed) => changed,
            Err(e) => {
                error!("Failed to apply configuration overrides: {}", e);
                std::process::exit(1);
            }
        };

        if changed {
            info!("Configuration overrides applied and persisted to disk");
            let listen_address = server
                .config_manager
                .server_config
                .as_ref()
                .expect("Server configuration not loaded. This should not happen as config is loaded in new().")
                .listen_address
                .clone();
            server.listen_address = match listen_address.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    error!("Invalid listen address after override: {}", e);
                    std::process::exit(1);
                }
            };
        } else {
            info!("Command-line values match existing config, no changes needed");
        }
    }

    // Run the server and the shutdown signal handler concurrently.
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    // Perform graceful shutdown.
    server.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
