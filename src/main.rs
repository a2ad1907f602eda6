//! taskhost - Worker-side task executor
//!
//! This is the main entry point for the taskhost binary.
//! The executor registers with the coordinator, runs the task attempts it
//! launches, and reports status updates and heartbeats back.

mod cli;
mod config;
mod coordinator;
mod error;
mod executor;
mod logging;
mod protocol;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::WorkerConfig;
use crate::coordinator::{ClientEvent, CoordinatorClient, CoordinatorClientConfig};
use crate::error::{Error, Result};
use crate::executor::{builtin_catalog, LocalBlockStore, TaskExecutor};
use crate::logging::LogGuards;
use crate::protocol::{BlockStoreId, RegisterExecutorRequest, PROTOCOL_VERSION};

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    // Commands that don't run the executor use simple setup
    match &cli.command {
        Commands::Version => {
            print_version();
            return Ok(());
        }
        Commands::Tasks => {
            for kind in builtin_catalog().kinds() {
                println!("{}", kind);
            }
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        Commands::Run { .. } => {}
    }

    let Commands::Run { config, executor_id, coordinator } = cli.command else {
        return Ok(());
    };

    let config = match load_run_config(config.as_deref(), executor_id, coordinator) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive for the lifetime of the program
    let _log_guards: LogGuards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = %PROTOCOL_VERSION,
        "Starting taskhost executor"
    );

    if let Err(e) = run_executor(config) {
        error!(error = %e.format_for_log(), "Executor terminated");
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }

    Ok(())
}

fn print_version() {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    println!("protocol {}", PROTOCOL_VERSION);
}

/// Load the configuration and apply command-line overrides
fn load_run_config(
    path: Option<&str>,
    executor_id: Option<String>,
    coordinator: Option<String>,
) -> Result<WorkerConfig> {
    let mut config = WorkerConfig::load(path)?;
    if let Some(id) = executor_id {
        config.executor.id = Some(id);
    }
    if let Some(url) = coordinator {
        config.coordinator.url = url;
    }
    // pin a generated id so every component sees the same one
    config.executor.id = Some(config.executor_id());
    config.validate()?;
    Ok(config)
}

/// Run the executor in normal operation mode
fn run_executor(config: WorkerConfig) -> Result<()> {
    info!(
        executor_id = %config.executor_id(),
        coordinator_url = %config.coordinator.url,
        max_concurrent_tasks = config.executor.max_concurrent_tasks,
        "Configuration loaded"
    );

    ensure_directories(&[config.work_dir(), config.cache_dir(), config.block_dir()])?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("taskhost")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_executor_main(config))
}

/// Ensure required storage directories exist
fn ensure_directories(dirs: &[PathBuf]) -> Result<()> {
    for path in dirs {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| Error::IoWrite {
                path: path.clone(),
                source: e,
            })?;
            info!(path = %path.display(), "Created directory");
        }
    }
    Ok(())
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Async executor main loop
async fn async_executor_main(config: WorkerConfig) -> Result<()> {
    let executor_id = config.executor_id();
    let hostname = local_hostname();
    let block_store_id = BlockStoreId {
        executor_id: executor_id.clone(),
        host: hostname.clone(),
    };
    let block_store = Arc::new(LocalBlockStore::with_disk(block_store_id.clone(), config.block_dir())?);

    let client = Arc::new(CoordinatorClient::new(
        CoordinatorClientConfig::from_settings(&config.coordinator, &config.executor),
        RegisterExecutorRequest {
            executor_id: executor_id.clone(),
            hostname,
            cores: config.executor.effective_cores(),
            block_store_id,
        },
    ));

    let catalog = builtin_catalog();
    info!(kinds = ?catalog.kinds(), "Task catalog loaded");

    let executor = TaskExecutor::builder(
        executor_id.clone(),
        config.executor.clone(),
        client.clone(),
        block_store,
    )
    .catalog(catalog)
    .work_dir(config.work_dir())
    .cache_dir(config.cache_dir())
    .build()?;

    let mut events = client.start()?;
    let mut heartbeat_started = false;
    let mut exit_error = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received shutdown signal");
                break;
            }

            event = events.recv() => {
                match event {
                    Some(ClientEvent::Connected) => {
                        debug!("Connected to coordinator");
                    }
                    Some(ClientEvent::Registered { executor_id }) => {
                        info!(executor_id = %executor_id, "Registered with coordinator");
                        if !heartbeat_started {
                            executor.start();
                            heartbeat_started = true;
                        }
                    }
                    Some(ClientEvent::LaunchTask(launch)) => {
                        if let Err(e) = executor.launch(
                            launch.task_id,
                            launch.attempt_number,
                            launch.name,
                            launch.payload,
                        ) {
                            warn!(task_id = launch.task_id, error = %e.format_for_log(), "Launch rejected");
                            executor.report_rejected_launch(launch.task_id, &e).await;
                        }
                    }
                    Some(ClientEvent::KillTask(kill)) => {
                        executor.kill(kill.task_id, kill.interrupt_thread, &kill.reason);
                    }
                    Some(ClientEvent::RemoveBlock { block_id }) => {
                        if let Err(e) = executor.remove_block(&block_id) {
                            warn!(block_id = %block_id, error = %e, "Failed to remove block");
                        }
                    }
                    Some(ClientEvent::StopExecutor { reason }) => {
                        info!(reason = ?reason, "Coordinator asked executor to stop");
                        break;
                    }
                    Some(ClientEvent::Disconnected { reason }) => {
                        warn!(reason = %reason, "Disconnected from coordinator");
                    }
                    Some(ClientEvent::Reconnecting { attempt }) => {
                        info!(attempt = attempt, "Reconnecting to coordinator");
                    }
                    Some(ClientEvent::Error { message, fatal }) => {
                        if fatal {
                            error!(message = %message, "Fatal error from coordinator");
                            exit_error = Some(Error::Connection(message));
                            break;
                        } else {
                            warn!(message = %message, "Error from coordinator");
                        }
                    }
                    None => {
                        info!("Coordinator event channel closed");
                        break;
                    }
                }
            }
        }
    }

    // Graceful shutdown
    executor.stop().await;
    let timeout = config.executor.shutdown_timeout();
    if !executor.await_idle(timeout).await {
        warn!(running = ?executor.running_task_ids(), "Tasks still running at shutdown, killing them");
        executor.kill_all(true, "executor shutting down");
        executor.await_idle(timeout).await;
    }
    if let Err(e) = client.shutdown("executor stopped").await {
        debug!(error = %e, "Coordinator client already gone");
    }

    info!(executor_id = %executor_id, "Executor shut down");

    match exit_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: cli::ConfigSubcommand) -> Result<()> {
    use cli::ConfigSubcommand;

    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = WorkerConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let created = config::init_config(path.as_deref(), force)?;
            println!("Created configuration file: {}", created.display());
        }
        ConfigSubcommand::Validate { config } => match WorkerConfig::load(config.as_deref()) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}
