//! worktime-hook: activity capture entry point for worktime.
//!
//! Invoked by the host tool before each action. Detects the project, sends one
//! event to the daemon within a short deadline and, if that fails, appends the
//! event to the local fallback log. Always exits 0 on the capture path.
//!
//! ## Subcommands
//!
//! - (none): capture one activity
//! - `replay`: re-send every fallback-logged event to the daemon

mod capture;
mod daemon_client;
mod logging;
mod replay;

use capture::{ActivityCapture, CaptureInput, CaptureOutcome};
use clap::{Parser, Subcommand};
use daemon_client::DeliveryClient;
use std::path::PathBuf;
use std::time::Duration;
use worktime_core::config::{load_config_or_default, ConfigOverrides};
use worktime_core::FallbackLog;
use worktime_protocol::ActivityType;

#[derive(Parser)]
#[command(name = "worktime-hook")]
#[command(about = "Records coding-assistant activity for worktime")]
#[command(version)]
struct Cli {
    /// Log diagnostics to stderr (also WORKTIME_DEBUG=1)
    #[arg(long, global = true)]
    debug: bool,

    /// Config file (default ~/.worktime/config.toml or WORKTIME_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Daemon base URL, e.g. http://127.0.0.1:9193
    #[arg(long, global = true, value_name = "URL")]
    daemon_url: Option<String>,

    /// Fallback log location
    #[arg(long, global = true, value_name = "PATH")]
    fallback_log: Option<PathBuf>,

    /// Delivery deadline in milliseconds
    #[arg(long, value_name = "N")]
    timeout_ms: Option<u64>,

    /// Command that triggered the hook
    #[arg(long)]
    command: Option<String>,

    /// Free-form description of the action
    #[arg(long)]
    description: Option<String>,

    /// Working directory to attribute (default: process cwd)
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// command, edit, query or other
    #[arg(long, default_value = "command")]
    activity_type: ActivityType,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand)]
enum Action {
    /// Re-send fallback-logged events to the daemon (the log is left intact)
    Replay {
        /// Per-event delivery deadline in milliseconds
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug || logging::debug_from_env());

    let overrides = ConfigOverrides {
        daemon_url: cli.daemon_url.clone(),
        timeout_ms: cli.timeout_ms,
        fallback_log: cli.fallback_log.clone(),
        ..ConfigOverrides::default()
    };
    let config = load_config_or_default(cli.config.as_deref()).with_overrides(&overrides);

    match cli.action {
        None => {
            let client = DeliveryClient::new(&config.daemon_url, config.timeout());
            tracing::debug!(endpoint = client.endpoint(), timeout_ms = config.timeout_ms, "Capturing activity");
            let capture = ActivityCapture::new(config, client);
            let input = CaptureInput {
                command: cli.command.unwrap_or_default(),
                description: cli.description.unwrap_or_default(),
                activity_type: cli.activity_type,
                cwd: cli.cwd,
            };
            match capture.capture(&input) {
                CaptureOutcome::Dropped(err) => {
                    tracing::warn!(error = %err, "worktime-hook dropped an event");
                }
                outcome => tracing::debug!(?outcome, "worktime-hook capture finished"),
            }
        }
        Some(Action::Replay { timeout_ms }) => {
            let Some(path) = config.fallback_log_path() else {
                eprintln!("worktime-hook: no fallback log location (home directory unknown)");
                std::process::exit(1);
            };
            let log = FallbackLog::new(path, env!("CARGO_PKG_VERSION"));
            let client = DeliveryClient::new(&config.daemon_url, Duration::from_millis(timeout_ms));
            match replay::run(&log, &client) {
                Ok(summary) => {
                    println!(
                        "delivered={} duplicate={} flagged={} failed={} skipped={}",
                        summary.delivered,
                        summary.duplicates,
                        summary.flagged,
                        summary.failed,
                        summary.skipped
                    );
                }
                Err(err) => {
                    tracing::error!(error = %err, "worktime-hook replay failed");
                    eprintln!("worktime-hook: {}", err);
                    std::process::exit(1);
                }
            }
        }
    }
}
