//! worktime daemon entrypoint.
//!
//! Single-writer service that turns activity events into sessions and work
//! blocks. Serves HTTP on a local address, persists to SQLite, and sweeps idle
//! state on a timer so work is recorded as stopped even when no event arrives.
//!
//! ## Subcommands
//!
//! - `run` (default): serve until SIGINT/SIGTERM
//! - `service <action>`: manage the daemon as a per-user background service

use chrono::Utc;
use clap::{Parser, Subcommand};
use fs_err as fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use worktime_core::config::{load_config, ConfigOverrides};
use worktime_core::{Config, FallbackLog};

mod aggregator;
mod db;
mod model;
mod replay;
mod server;
mod service;
mod state;

use aggregator::AggregatorConfig;
use db::Db;
use service::{platform_service_manager, ServiceDefinition, LOG_FILE_PREFIX};
use state::SharedState;

#[derive(Parser)]
#[command(name = "worktime-daemon")]
#[command(about = "Aggregates coding activity into sessions and work blocks")]
#[command(version)]
struct Cli {
    /// Config file (default ~/.worktime/config.toml or WORKTIME_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to serve on, e.g. 127.0.0.1:9193
    #[arg(long, global = true, value_name = "ADDR")]
    listen: Option<String>,

    /// SQLite database location
    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,

    /// Log filter (overrides RUST_LOG), e.g. debug or worktime_daemon=trace
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write the process id here while running
    #[arg(long, global = true, value_name = "PATH")]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve HTTP until interrupted
    Run,
    /// Manage the background service
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand)]
enum ServiceAction {
    Install,
    Uninstall,
    Start,
    Stop,
    Status,
    Logs {
        /// Number of trailing lines
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        listen: cli.listen.clone(),
        database: cli.database.clone(),
        ..ConfigOverrides::default()
    };
    let (config, config_error) = match load_config(cli.config.as_deref()) {
        Ok(config) => (config.with_overrides(&overrides), None),
        Err(err) => (Config::default().with_overrides(&overrides), Some(err)),
    };

    match cli.command {
        Some(Commands::Service { action }) => {
            init_cli_logging(cli.log_level.as_deref());
            if let Some(err) = config_error {
                warn!(error = %err, "Config unusable; using defaults");
            }
            run_service_action(action, &config, cli.config)
        }
        Some(Commands::Run) | None => {
            let log_dir = config.daemon.log_dir_path();
            let _guard = init_logging(cli.log_level.as_deref(), log_dir.as_deref());
            if let Some(err) = config_error {
                warn!(error = %err, "Config unusable; using defaults");
            }
            run_daemon(&config, cli.pid_file.as_deref())
        }
    }
}

fn run_daemon(config: &Config, pid_file: Option<&Path>) -> ExitCode {
    let Some(db_path) = config.daemon.database_path() else {
        error!("Failed to resolve daemon database path (home directory unknown)");
        return ExitCode::FAILURE;
    };

    let db = match Db::new(db_path.clone()) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, path = %db_path.display(), "Failed to initialize daemon database");
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = pid_file {
        if let Err(err) = write_pid_file(path) {
            error!(error = %err, path = %path.display(), "Failed to write pid file");
            return ExitCode::FAILURE;
        }
    }

    let fallback = config
        .fallback_log_path()
        .map(|path| FallbackLog::new(path, env!("CARGO_PKG_VERSION")));
    let aggregator_config = AggregatorConfig::from_daemon_config(&config.daemon);
    let shared_state = Arc::new(SharedState::new(db, aggregator_config, fallback.as_ref()));

    info!(
        database = %db_path.display(),
        idle_timeout_secs = aggregator_config.idle_timeout.num_seconds(),
        session_secs = aggregator_config.session_length.num_seconds(),
        "worktime daemon started"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(serve_until_shutdown(
        Arc::clone(&shared_state),
        config.daemon.listen.clone(),
        config.daemon.sweep_interval(),
    ));

    if let Some(path) = pid_file {
        if let Err(err) = fs::remove_file(path) {
            warn!(error = %err, "Failed to remove pid file");
        }
    }

    match result {
        Ok(()) => {
            info!("worktime daemon stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "worktime daemon failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve_until_shutdown(
    state: Arc<SharedState>,
    listen: String,
    sweep_every: Duration,
) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|err| format!("Failed to bind {}: {}", listen, err))?;
    let addr = listener
        .local_addr()
        .map_err(|err| format!("Failed to read bound address: {}", err))?;
    info!(addr = %addr, "Listening for activity");

    let sweeper = tokio::spawn(sweep_loop(Arc::clone(&state), sweep_every));
    let served = server::serve(listener, Arc::clone(&state), shutdown_signal())
        .await
        .map_err(|err| format!("HTTP server error: {}", err));
    sweeper.abort();

    // One last pass so blocks idle at shutdown are stored as closed.
    match tokio::task::spawn_blocking(move || state.sweep(Utc::now())).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(error = %err, "Final sweep failed"),
        Err(err) => warn!(error = %err, "Final sweep task failed"),
    }

    served
}

async fn sweep_loop(state: Arc<SharedState>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; startup replay already swept.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let state = Arc::clone(&state);
        match tokio::task::spawn_blocking(move || state.sweep(Utc::now())).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "Periodic sweep failed"),
            Err(err) => warn!(error = %err, "Periodic sweep task failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

fn run_service_action(action: ServiceAction, config: &Config, config_path: Option<PathBuf>) -> ExitCode {
    let Some(log_dir) = config.daemon.log_dir_path() else {
        eprintln!("worktime-daemon: no log directory (home directory unknown)");
        return ExitCode::FAILURE;
    };
    let manager = match platform_service_manager(log_dir) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("worktime-daemon: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let result = match action {
        ServiceAction::Install => match std::env::current_exe() {
            Ok(executable) => manager.install(&ServiceDefinition {
                executable,
                config: config_path,
            }),
            Err(err) => {
                eprintln!("worktime-daemon: cannot locate own executable: {}", err);
                return ExitCode::FAILURE;
            }
        },
        ServiceAction::Uninstall => manager.uninstall(),
        ServiceAction::Start => manager.start(),
        ServiceAction::Stop => manager.stop(),
        ServiceAction::Status => manager.status().map(|status| println!("{}", status)),
        ServiceAction::Logs { lines } => manager.logs(lines).map(|lines| {
            for line in lines {
                println!("{}", line);
            }
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("worktime-daemon: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn env_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Stdout plus a daily-rolling `daemon.log` in `log_dir`. The returned guard
/// flushes the file writer when dropped.
fn init_logging(level: Option<&str>, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir.filter(|dir| fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn init_cli_logging(level: Option<&str>) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .init();
}

fn write_pid_file(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| format!("Failed to create pid dir: {}", err))?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
        .map_err(|err| format!("Failed to write pid: {}", err))
}
