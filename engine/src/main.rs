//! syncwarden: scheduled directory synchronization manager
//!
//! The engine replicates local directories to a remote host over SSH on
//! per-task intervals, keeping overwritten files and deletions recoverable
//! in remote history directories.
// This is the binary entry point. It is responsible for:
// - Initializing logging and configuration.
// - Building the `Engine` value (store, secret box, event bus).
// - Dispatching CLI subcommands against the management surface.
// - Running the scheduler daemon with graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

// The engine is organized into several modules, each with a distinct responsibility.
mod engine;
mod events;
mod handlers;
mod process;
mod remote;
mod scheduler;
mod secret;
mod store;
mod transfer;

#[cfg(test)]
mod tests;

use engine::Engine;
use handlers::TaskForm;
use shared::config::{Tunables, WardenSettings};

/// Command-line interface for the synchronization engine
#[derive(Parser, Debug)]
#[command(name = "syncwarden")]
#[command(about = "Scheduled directory synchronization manager", long_about = None)]
struct Cli {
    /// Path to the settings file (default: ./warden.toml)
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the data directory from the settings file
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler daemon until interrupted
    Run,
    /// List all tasks
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one task as JSON
    Show { id: i64 },
    /// Create a task
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 22)]
        port: u16,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        local_dir: String,
        #[arg(long)]
        remote_dir: String,
        /// Minutes between scheduled runs
        #[arg(long, default_value_t = 60)]
        interval: u32,
        /// Keep overwritten files under the remote versions directory
        #[arg(long)]
        versions: bool,
        /// Move remotely deleted files to the remote trash directory
        #[arg(long)]
        trash: bool,
        /// Create the task without scheduling it
        #[arg(long)]
        disabled: bool,
    },
    /// Update a task; unspecified fields keep their value
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        local_dir: Option<String>,
        #[arg(long)]
        remote_dir: Option<String>,
        #[arg(long)]
        interval: Option<u32>,
        #[arg(long, value_name = "BOOL")]
        versions: Option<bool>,
        #[arg(long, value_name = "BOOL")]
        trash: Option<bool>,
    },
    /// Delete a task and its logs
    Remove { id: i64 },
    /// Enable scheduled runs for a task
    Enable { id: i64 },
    /// Disable scheduled runs for a task
    Disable { id: i64 },
    /// Run one sync immediately
    Sync { id: i64 },
    /// Show recent run logs for a task
    Logs {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Test SSH connectivity with the given credentials
    TestConnection {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 22)]
        port: u16,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("warden.toml"));
    let mut settings = match WardenSettings::load(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load settings: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.to_string_lossy().to_string();
    }

    if matches!(cli.command, Command::Run) {
        run_daemon(settings).await
    } else {
        run_once(settings, cli.command).await
    }
}

/// Run the scheduler daemon until a shutdown signal arrives.
async fn run_daemon(settings: WardenSettings) -> Result<()> {
    // Logs go to a daily-rolling JSON file; stdout stays quiet so the daemon
    // can run under a service manager.
    let file_appender = tracing_appender::rolling::daily(&settings.log_dir, "syncwarden.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("engine=info,shared=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    info!("syncwarden daemon starting up");

    let engine = match Engine::open(settings, Tunables::from_env()).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("FATAL: failed to initialize engine");
            error!("Error: {}", e);
            let mut source = e.source();
            while let Some(inner) = source {
                error!("  Caused by: {}", inner);
                source = inner.source();
            }
            std::process::exit(1);
        }
    };

    let mut scheduler = engine.scheduler();
    scheduler.start().await?;

    // Set up signal handling for graceful shutdown.
    let shutdown_signal = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
            let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                },
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                },
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
        }
    };

    tokio::select! {
        result = scheduler.run() => {
            if let Err(e) = result {
                error!("Scheduler error: {}", e);
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received");
        }
    }

    scheduler.stop().await;
    engine.close().await;
    info!("syncwarden daemon shutdown complete");
    Ok(())
}

/// Run one management subcommand and exit.
async fn run_once(settings: WardenSettings, command: Command) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("engine=warn,shared=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .init();

    let engine = Engine::open(settings, Tunables::from_env()).await?;
    let result = dispatch_command(&engine, command).await;
    engine.close().await;
    result
}

async fn dispatch_command(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Run => anyhow::bail!("run is handled by the daemon path"),

        Command::List { json } => {
            let tasks = handlers::list_tasks(engine).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                println!(
                    "{:<5} {:<20} {:<28} {:>8} {:>8} {:<8}",
                    "ID", "NAME", "REMOTE", "EVERY", "ENABLED", "LAST"
                );
                for task in tasks {
                    let last = task
                        .last_sync_status
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<5} {:<20} {:<28} {:>7}m {:>8} {:<8}",
                        task.id,
                        task.name,
                        format!("{}@{}", task.username, task.remote_host),
                        task.interval_minutes,
                        task.enabled,
                        last
                    );
                }
            }
            Ok(())
        }

        Command::Show { id } => {
            let task = handlers::get_task(engine, id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }

        Command::Add {
            name,
            host,
            port,
            username,
            password,
            local_dir,
            remote_dir,
            interval,
            versions,
            trash,
            disabled,
        } => {
            let form = TaskForm {
                name,
                remote_host: host,
                remote_port: port,
                username,
                password,
                local_dir,
                remote_dir,
                interval_minutes: interval,
                version_enabled: versions,
                trash_enabled: trash,
                enabled: !disabled,
            };
            let id = handlers::create_task(engine, None, form).await?;
            println!("Created task {}", id);
            Ok(())
        }

        Command::Update {
            id,
            name,
            host,
            port,
            username,
            password,
            local_dir,
            remote_dir,
            interval,
            versions,
            trash,
        } => {
            let current = handlers::get_task(engine, id).await?;
            let form = TaskForm {
                name: name.unwrap_or(current.name),
                remote_host: host.unwrap_or(current.remote_host),
                remote_port: port.unwrap_or(current.remote_port),
                username: username.unwrap_or(current.username),
                password,
                local_dir: local_dir.unwrap_or(current.local_dir),
                remote_dir: remote_dir.unwrap_or(current.remote_dir),
                interval_minutes: interval.unwrap_or(current.interval_minutes),
                version_enabled: versions.unwrap_or(current.version_enabled),
                trash_enabled: trash.unwrap_or(current.trash_enabled),
                enabled: current.enabled,
            };
            handlers::update_task(engine, None, id, form).await?;
            println!("Updated task {}", id);
            Ok(())
        }

        Command::Remove { id } => {
            handlers::delete_task(engine, None, id).await?;
            println!("Removed task {}", id);
            Ok(())
        }

        Command::Enable { id } => {
            handlers::toggle_task(engine, None, id, true).await?;
            println!("Enabled task {}", id);
            Ok(())
        }

        Command::Disable { id } => {
            handlers::toggle_task(engine, None, id, false).await?;
            println!("Disabled task {}", id);
            Ok(())
        }

        Command::Sync { id } => {
            let report = handlers::sync_task(engine, id).await;
            if let Some(output) = &report.output {
                println!("{}", output);
            }
            if report.success {
                let mode = report
                    .sync_mode
                    .map(|m| m.as_str())
                    .unwrap_or("rsync");
                println!("Sync finished ({})", mode);
                Ok(())
            } else {
                match report.error {
                    Some(error) => anyhow::bail!("Sync failed: {}", error),
                    None => anyhow::bail!("Sync failed"),
                }
            }
        }

        Command::Logs { id, json } => {
            let logs = handlers::get_logs(engine, id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&logs)?);
            } else {
                for entry in logs {
                    let when = chrono::DateTime::from_timestamp(entry.timestamp, 0)
                        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| entry.timestamp.to_string());
                    println!(
                        "{}  {:<7} {:<5} {:>7.1}s",
                        when,
                        entry.status.as_str(),
                        entry.sync_mode.as_str(),
                        entry.duration_s
                    );
                }
            }
            Ok(())
        }

        Command::TestConnection {
            host,
            port,
            username,
            password,
        } => {
            let report = handlers::test_connection(
                engine,
                &host,
                port,
                &username,
                password.as_deref().unwrap_or(""),
            )
            .await;
            if report.success {
                println!("Connection OK");
                Ok(())
            } else {
                anyhow::bail!(
                    "Connection failed: {}",
                    report.error.unwrap_or_else(|| "unknown error".to_string())
                )
            }
        }
    }
}
