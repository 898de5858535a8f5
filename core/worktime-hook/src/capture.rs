//! One capture invocation: detect the project, deliver once, fall back.
//!
//! Nothing in here may fail the host tool. Every path ends in a
//! [`CaptureOutcome`], and the CLI maps all of them to exit code 0.

use crate::daemon_client::{Deliver, DeliveryError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use worktime_core::{
    current_user_id, new_event_id, Config, FallbackError, FallbackLog, IgnoreMatcher,
    ProjectDetector, ProjectInfo,
};
use worktime_protocol::{ActivityAck, ActivityEvent, ActivitySource, ActivityType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureInput {
    pub command: String,
    pub description: String,
    pub activity_type: ActivityType,
    /// Defaults to the process working directory.
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Working directory unavailable: {0}")]
    WorkingDir(String),

    #[error("No fallback log location (home directory unknown)")]
    NoFallbackPath,

    #[error("Delivery failed ({delivery}) and fallback failed: {source}")]
    Fallback {
        delivery: DeliveryError,
        #[source]
        source: FallbackError,
    },
}

#[derive(Debug)]
pub enum CaptureOutcome {
    Disabled,
    Ignored,
    Delivered(ActivityAck),
    FellBack(DeliveryError),
    Dropped(CaptureError),
}

pub struct ActivityCapture<D> {
    config: Config,
    ignore: IgnoreMatcher,
    delivery: D,
    version: String,
}

impl<D: Deliver> ActivityCapture<D> {
    pub fn new(config: Config, delivery: D) -> Self {
        let ignore = config.ignore_matcher().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Ignoring invalid ignore_patterns");
            IgnoreMatcher::empty()
        });
        Self {
            config,
            ignore,
            delivery,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn capture(&self, input: &CaptureInput) -> CaptureOutcome {
        if !self.config.enabled {
            tracing::debug!("Capture disabled by configuration");
            return CaptureOutcome::Disabled;
        }

        let cwd = match resolve_cwd(input.cwd.as_deref()) {
            Ok(cwd) => cwd,
            Err(err) => {
                tracing::debug!(error = %err, "Capture dropped");
                return CaptureOutcome::Dropped(err);
            }
        };

        if self.ignore.is_ignored(&cwd) {
            tracing::debug!(cwd = %cwd.display(), "Working directory ignored");
            return CaptureOutcome::Ignored;
        }

        let event = self.build_event(input, &cwd);

        match self.delivery.send(&event) {
            Ok(ack) => {
                tracing::debug!(activity_id = %ack.activity_id, status = ?ack.status, "Event delivered");
                CaptureOutcome::Delivered(ack)
            }
            Err(delivery) => {
                tracing::debug!(error = %delivery, event_id = %event.id, "Delivery failed; writing fallback");
                self.fall_back(&event, delivery)
            }
        }
    }

    pub fn build_event(&self, input: &CaptureInput, cwd: &Path) -> ActivityEvent {
        let project = ProjectDetector::new(&self.config.project_names).detect(cwd);
        ActivityEvent {
            id: new_event_id(),
            user_id: current_user_id(self.config.user_id.as_deref()),
            project_name: project.name.clone(),
            project_path: project.path_string(),
            activity_type: input.activity_type,
            activity_source: ActivitySource::Hook,
            timestamp: Utc::now(),
            command: input.command.clone(),
            description: input.description.clone(),
            metadata: build_metadata(cwd, &project),
        }
    }

    fn fall_back(&self, event: &ActivityEvent, delivery: DeliveryError) -> CaptureOutcome {
        let Some(path) = self.config.fallback_log_path() else {
            return CaptureOutcome::Dropped(CaptureError::NoFallbackPath);
        };
        let log = FallbackLog::new(path, &self.version);
        match log.append(event) {
            Ok(()) => CaptureOutcome::FellBack(delivery),
            Err(source) => {
                tracing::debug!(error = %source, path = %log.path().display(), "Fallback write failed; event dropped");
                CaptureOutcome::Dropped(CaptureError::Fallback { delivery, source })
            }
        }
    }
}

fn resolve_cwd(explicit: Option<&Path>) -> Result<PathBuf, CaptureError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    match std::env::current_dir() {
        Ok(cwd) => Ok(cwd),
        Err(err) => std::env::var_os("PWD")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| CaptureError::WorkingDir(err.to_string())),
    }
}

fn build_metadata(cwd: &Path, project: &ProjectInfo) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("working_dir".to_string(), cwd.to_string_lossy().to_string());
    metadata.insert(
        "project_type".to_string(),
        project.project_type.as_str().to_string(),
    );
    if let Some(branch) = &project.git_branch {
        metadata.insert("git_branch".to_string(), branch.clone());
    }
    metadata.insert("platform".to_string(), std::env::consts::OS.to_string());
    metadata.insert(
        "architecture".to_string(),
        std::env::consts::ARCH.to_string(),
    );
    if let Some(hostname) = hostname() {
        metadata.insert("hostname".to_string(), hostname);
    }
    if let Some(ppid) = get_ppid() {
        metadata.insert("parent_pid".to_string(), ppid.to_string());
    }
    metadata
}

fn get_ppid() -> Option<u32> {
    #[cfg(unix)]
    {
        // SAFETY: getppid() cannot fail and takes no arguments.
        #[allow(unsafe_code)]
        Some(unsafe { libc::getppid() } as u32)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

fn hostname() -> Option<String> {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: the buffer is valid for `buf.len()` bytes for the duration
        // of the call; gethostname writes at most that many.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc != 0 {
            return None;
        }
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").ok().filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon_client::tests::closed_port_url;
    use crate::daemon_client::DeliveryClient;
    use std::cell::RefCell;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use worktime_protocol::AckStatus;

    struct FakeDelivery {
        result: Result<(), DeliveryError>,
        sent: RefCell<Vec<ActivityEvent>>,
    }

    impl FakeDelivery {
        fn ok() -> Self {
            Self {
                result: Ok(()),
                sent: RefCell::new(Vec::new()),
            }
        }

        fn failing(err: DeliveryError) -> Self {
            Self {
                result: Err(err),
                sent: RefCell::new(Vec::new()),
            }
        }
    }

    impl Deliver for FakeDelivery {
        fn send(&self, event: &ActivityEvent) -> Result<ActivityAck, DeliveryError> {
            self.sent.borrow_mut().push(event.clone());
            self.result.clone().map(|()| ActivityAck {
                status: AckStatus::Accepted,
                activity_id: event.id.clone(),
                timestamp: Utc::now(),
            })
        }
    }

    fn config_in(dir: &Path) -> Config {
        Config {
            fallback_log: Some(dir.join("logs").join("fallback.log")),
            user_id: Some("u1".to_string()),
            ..Config::default()
        }
    }

    fn project_dir(root: &Path) -> PathBuf {
        let project = root.join("billing");
        std::fs::create_dir_all(&project).expect("project dir");
        std::fs::write(project.join("Cargo.toml"), "").expect("marker");
        project
    }

    fn input(cwd: &Path) -> CaptureInput {
        CaptureInput {
            command: "cargo test".to_string(),
            description: "run tests".to_string(),
            activity_type: ActivityType::Command,
            cwd: Some(cwd.to_path_buf()),
        }
    }

    fn fallback_lines(config: &Config) -> Vec<String> {
        let path = config.fallback_log_path().expect("path");
        std::fs::read_to_string(path)
            .map(|contents| contents.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    #[test]
    fn disabled_capture_is_a_no_op() {
        let temp = tempdir().expect("temp dir");
        let config = Config {
            enabled: false,
            ..config_in(temp.path())
        };
        let capture = ActivityCapture::new(config.clone(), FakeDelivery::failing(DeliveryError::Timeout));

        let outcome = capture.capture(&input(&project_dir(temp.path())));
        assert!(matches!(outcome, CaptureOutcome::Disabled));
        assert!(capture.delivery.sent.borrow().is_empty());
        assert!(fallback_lines(&config).is_empty());
    }

    #[test]
    fn ignored_directory_is_a_no_op() {
        let temp = tempdir().expect("temp dir");
        let project = project_dir(temp.path());
        let config = Config {
            ignore_patterns: vec![format!("{}/**", temp.path().display())],
            ..config_in(temp.path())
        };
        let capture = ActivityCapture::new(config, FakeDelivery::ok());

        assert!(matches!(capture.capture(&input(&project)), CaptureOutcome::Ignored));
        assert!(capture.delivery.sent.borrow().is_empty());
    }

    #[test]
    fn successful_delivery_writes_no_fallback() {
        let temp = tempdir().expect("temp dir");
        let config = config_in(temp.path());
        let capture = ActivityCapture::new(config.clone(), FakeDelivery::ok());

        let outcome = capture.capture(&input(&project_dir(temp.path())));
        assert!(matches!(outcome, CaptureOutcome::Delivered(_)));
        assert!(fallback_lines(&config).is_empty());

        let sent = capture.delivery.sent.borrow();
        assert_eq!(sent.len(), 1);
        let event = &sent[0];
        assert_eq!(event.user_id, "u1");
        assert_eq!(event.project_name, "billing");
        assert_eq!(event.activity_source, ActivitySource::Hook);
        assert_eq!(event.metadata.get("project_type").map(String::as_str), Some("rust"));
        assert_eq!(
            event.metadata.get("platform").map(String::as_str),
            Some(std::env::consts::OS)
        );
        assert!(event.metadata.contains_key("working_dir"));
        assert!(event.id.starts_with("evt-"));
    }

    #[test]
    fn failed_delivery_appends_exactly_one_matching_record() {
        let temp = tempdir().expect("temp dir");
        let config = config_in(temp.path());
        let capture = ActivityCapture::new(config.clone(), FakeDelivery::failing(DeliveryError::ServerError(500)));

        let outcome = capture.capture(&input(&project_dir(temp.path())));
        assert!(matches!(outcome, CaptureOutcome::FellBack(DeliveryError::ServerError(500))));

        let lines = fallback_lines(&config);
        assert_eq!(lines.len(), 1);
        let record: worktime_protocol::FallbackRecord =
            serde_json::from_str(&lines[0]).expect("record");
        assert_eq!(record.event, capture.delivery.sent.borrow()[0]);
        assert_eq!(record.source, "hook_fallback");
    }

    #[test]
    fn unwritable_fallback_is_dropped_not_panicking() {
        let temp = tempdir().expect("temp dir");
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "").expect("blocker");
        let config = Config {
            fallback_log: Some(blocker.join("fallback.log")),
            ..config_in(temp.path())
        };
        let capture = ActivityCapture::new(config, FakeDelivery::failing(DeliveryError::ConnectionRefused));

        let outcome = capture.capture(&input(&project_dir(temp.path())));
        assert!(matches!(
            outcome,
            CaptureOutcome::Dropped(CaptureError::Fallback {
                delivery: DeliveryError::ConnectionRefused,
                ..
            })
        ));
    }

    #[test]
    fn unreachable_daemon_returns_within_deadline_and_falls_back() {
        let temp = tempdir().expect("temp dir");
        let config = Config {
            daemon_url: closed_port_url(),
            ..config_in(temp.path())
        };
        let deadline = config.timeout();
        let client = DeliveryClient::new(&config.daemon_url, deadline);
        let capture = ActivityCapture::new(config.clone(), client);

        let started = Instant::now();
        let outcome = capture.capture(&input(&project_dir(temp.path())));
        let elapsed = started.elapsed();

        assert!(matches!(outcome, CaptureOutcome::FellBack(_)));
        assert!(elapsed < deadline + Duration::from_millis(500), "took {elapsed:?}");
        assert_eq!(fallback_lines(&config).len(), 1);
    }
}
