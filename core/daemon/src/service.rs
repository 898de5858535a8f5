//! Background-service lifecycle for the daemon.
//!
//! One `ServiceManager` per platform: a systemd user unit on Linux, a launchd
//! agent on macOS. Both write their definition file and shell out to the
//! platform tool. Logs come from the daemon's own rolling log file, so `logs`
//! works the same everywhere.

use fs_err as fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const SERVICE_NAME: &str = "worktime-daemon";
pub const LAUNCHD_LABEL: &str = "dev.worktime.daemon";
pub const LOG_FILE_PREFIX: &str = "daemon.log";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service management is not supported on {0}")]
    Unsupported(String),

    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {args} failed: {stderr}")]
    Command {
        program: String,
        args: String,
        stderr: String,
    },

    #[error("No daemon log found in {0}")]
    NoLogs(PathBuf),

    #[error("Failed to read log {path}: {source}")]
    ReadLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the installed service runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub executable: PathBuf,
    pub config: Option<PathBuf>,
}

impl ServiceDefinition {
    fn arguments(&self) -> Vec<String> {
        let mut args = vec![self.executable.display().to_string(), "run".to_string()];
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        args
    }
}

pub trait ServiceManager {
    fn install(&self, definition: &ServiceDefinition) -> Result<(), ServiceError>;
    fn uninstall(&self) -> Result<(), ServiceError>;
    fn start(&self) -> Result<(), ServiceError>;
    fn stop(&self) -> Result<(), ServiceError>;
    /// Human-readable state as reported by the platform tool.
    fn status(&self) -> Result<String, ServiceError>;
    /// Last `lines` lines of the newest daemon log file.
    fn logs(&self, lines: usize) -> Result<Vec<String>, ServiceError>;
}

/// Picks the manager for the platform this binary was built for.
pub fn platform_service_manager(log_dir: PathBuf) -> Result<Box<dyn ServiceManager>, ServiceError> {
    match std::env::consts::OS {
        "linux" => {
            let config_dir = dirs::config_dir().ok_or(ServiceError::NoHome)?;
            Ok(Box::new(SystemdUserManager::new(
                config_dir.join("systemd").join("user"),
                log_dir,
            )))
        }
        "macos" => {
            let home = dirs::home_dir().ok_or(ServiceError::NoHome)?;
            Ok(Box::new(LaunchdManager::new(
                home.join("Library").join("LaunchAgents"),
                log_dir,
            )))
        }
        other => Ok(Box::new(UnsupportedManager::new(other))),
    }
}

// ── systemd (user) ──

pub struct SystemdUserManager {
    unit_dir: PathBuf,
    log_dir: PathBuf,
    program: String,
}

impl SystemdUserManager {
    pub fn new(unit_dir: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            unit_dir,
            log_dir,
            program: "systemctl".to_string(),
        }
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(format!("{}.service", SERVICE_NAME))
    }

    fn systemctl(&self, args: &[&str]) -> Result<String, ServiceError> {
        let mut full = vec!["--user"];
        full.extend_from_slice(args);
        run(&self.program, &full)
    }
}

impl ServiceManager for SystemdUserManager {
    fn install(&self, definition: &ServiceDefinition) -> Result<(), ServiceError> {
        write_file(&self.unit_path(), &systemd_unit(definition))?;
        self.systemctl(&["daemon-reload"])?;
        self.systemctl(&["enable", SERVICE_NAME])?;
        tracing::info!(path = %self.unit_path().display(), "Installed systemd user unit");
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        if let Err(err) = self.systemctl(&["disable", "--now", SERVICE_NAME]) {
            tracing::warn!(error = %err, "Failed to disable unit before removal");
        }
        remove_file(&self.unit_path())?;
        self.systemctl(&["daemon-reload"])?;
        Ok(())
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.systemctl(&["start", SERVICE_NAME]).map(|_| ())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.systemctl(&["stop", SERVICE_NAME]).map(|_| ())
    }

    fn status(&self) -> Result<String, ServiceError> {
        // `is-active` exits non-zero for inactive units; the text is the answer.
        let output = capture(&self.program, &["--user", "is-active", SERVICE_NAME])?;
        Ok(if output.is_empty() {
            "unknown".to_string()
        } else {
            output
        })
    }

    fn logs(&self, lines: usize) -> Result<Vec<String>, ServiceError> {
        tail_latest_log(&self.log_dir, lines)
    }
}

pub fn systemd_unit(definition: &ServiceDefinition) -> String {
    let exec = definition
        .arguments()
        .iter()
        .map(|arg| quote_systemd(arg))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "[Unit]\n\
         Description=worktime activity daemon\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n"
    )
}

fn quote_systemd(arg: &str) -> String {
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
}

// ── launchd ──

pub struct LaunchdManager {
    agents_dir: PathBuf,
    log_dir: PathBuf,
    program: String,
}

impl LaunchdManager {
    pub fn new(agents_dir: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            agents_dir,
            log_dir,
            program: "launchctl".to_string(),
        }
    }

    pub fn plist_path(&self) -> PathBuf {
        self.agents_dir.join(format!("{}.plist", LAUNCHD_LABEL))
    }

    fn plist_arg(&self) -> String {
        self.plist_path().display().to_string()
    }
}

impl ServiceManager for LaunchdManager {
    fn install(&self, definition: &ServiceDefinition) -> Result<(), ServiceError> {
        write_file(&self.plist_path(), &launchd_plist(definition, &self.log_dir))?;
        tracing::info!(path = %self.plist_path().display(), "Installed launchd agent");
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        if let Err(err) = self.stop() {
            tracing::warn!(error = %err, "Failed to unload agent before removal");
        }
        remove_file(&self.plist_path())
    }

    fn start(&self) -> Result<(), ServiceError> {
        run(&self.program, &["load", "-w", &self.plist_arg()]).map(|_| ())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        run(&self.program, &["unload", &self.plist_arg()]).map(|_| ())
    }

    fn status(&self) -> Result<String, ServiceError> {
        match run(&self.program, &["list", LAUNCHD_LABEL]) {
            Ok(_) => Ok("loaded".to_string()),
            Err(ServiceError::Command { .. }) => Ok("not loaded".to_string()),
            Err(err) => Err(err),
        }
    }

    fn logs(&self, lines: usize) -> Result<Vec<String>, ServiceError> {
        tail_latest_log(&self.log_dir, lines)
    }
}

pub fn launchd_plist(definition: &ServiceDefinition, log_dir: &Path) -> String {
    let arguments = definition
        .arguments()
        .iter()
        .map(|arg| format!("        <string>{}</string>\n", escape_xml(arg)))
        .collect::<String>();
    let stderr = escape_xml(&log_dir.join("launchd.err").display().to_string());
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n\
         <dict>\n\
         \x20   <key>Label</key>\n\
         \x20   <string>{LAUNCHD_LABEL}</string>\n\
         \x20   <key>ProgramArguments</key>\n\
         \x20   <array>\n\
         {arguments}\
         \x20   </array>\n\
         \x20   <key>RunAtLoad</key>\n\
         \x20   <true/>\n\
         \x20   <key>KeepAlive</key>\n\
         \x20   <true/>\n\
         \x20   <key>StandardErrorPath</key>\n\
         \x20   <string>{stderr}</string>\n\
         </dict>\n\
         </plist>\n"
    )
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ── unsupported ──

pub struct UnsupportedManager {
    platform: String,
}

impl UnsupportedManager {
    pub fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
        }
    }

    fn unsupported<T>(&self) -> Result<T, ServiceError> {
        Err(ServiceError::Unsupported(self.platform.clone()))
    }
}

impl ServiceManager for UnsupportedManager {
    fn install(&self, _definition: &ServiceDefinition) -> Result<(), ServiceError> {
        self.unsupported()
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        self.unsupported()
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.unsupported()
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.unsupported()
    }

    fn status(&self) -> Result<String, ServiceError> {
        self.unsupported()
    }

    fn logs(&self, _lines: usize) -> Result<Vec<String>, ServiceError> {
        self.unsupported()
    }
}

// ── helpers ──

fn run(program: &str, args: &[&str]) -> Result<String, ServiceError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ServiceError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(ServiceError::Command {
            program: program.to_string(),
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Stdout regardless of exit status.
fn capture(program: &str, args: &[&str]) -> Result<String, ServiceError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ServiceError::Spawn {
            program: program.to_string(),
            source,
        })?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn write_file(path: &Path, contents: &str) -> Result<(), ServiceError> {
    let to_error = |source| ServiceError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(to_error)?;
    }
    fs::write(path, contents).map_err(to_error)
}

fn remove_file(path: &Path) -> Result<(), ServiceError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ServiceError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Daily rotation names files `daemon.log.YYYY-MM-DD`, so the newest sorts last.
fn tail_latest_log(log_dir: &Path, lines: usize) -> Result<Vec<String>, ServiceError> {
    let read_error = |source| ServiceError::ReadLog {
        path: log_dir.to_path_buf(),
        source,
    };
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServiceError::NoLogs(log_dir.to_path_buf()));
        }
        Err(err) => return Err(read_error(err)),
    };

    let mut newest: Option<PathBuf> = None;
    for entry in entries {
        let path = entry.map_err(read_error)?.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if is_log && newest.as_ref().map_or(true, |current| path > *current) {
            newest = Some(path);
        }
    }

    let path = newest.ok_or_else(|| ServiceError::NoLogs(log_dir.to_path_buf()))?;
    let contents = fs::read_to_string(&path).map_err(|source| ServiceError::ReadLog {
        path: path.clone(),
        source,
    })?;
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|line| line.to_string()).collect())
}
