//! Wire types and validation shared by worktime-hook and worktime-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but the hook reuses the
//! same types to build requests and fallback-log records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const ACTIVITY_PATH: &str = "/activity";
pub const FALLBACK_SOURCE: &str = "hook_fallback";
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_EVENT_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Command,
    Edit,
    Query,
    Other,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Command => "command",
            ActivityType::Edit => "edit",
            ActivityType::Query => "query",
            ActivityType::Other => "other",
        }
    }
}

impl FromStr for ActivityType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "command" => Ok(ActivityType::Command),
            "edit" => Ok(ActivityType::Edit),
            "query" => Ok(ActivityType::Query),
            "other" => Ok(ActivityType::Other),
            other => Err(format!("unknown activity type: {}", other)),
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    #[default]
    Hook,
    Manual,
    System,
}

/// A single observed action. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: String,
    pub user_id: String,
    pub project_name: String,
    pub project_path: String,
    pub activity_type: ActivityType,
    #[serde(default)]
    pub activity_source: ActivitySource,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ActivityEvent {
    pub fn to_request(&self) -> ActivityRequest {
        ActivityRequest {
            id: Some(self.id.clone()),
            user_id: self.user_id.clone(),
            project_name: self.project_name.clone(),
            project_path: self.project_path.clone(),
            activity_type: self.activity_type,
            activity_source: self.activity_source,
            command: self.command.clone(),
            description: self.description.clone(),
            timestamp: self.timestamp.to_rfc3339(),
            metadata: self.metadata.clone(),
        }
    }

    /// Checks an already-decoded event (e.g. one read back from a fallback log).
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_event_id(&self.id)?;
        require_string(&self.user_id, "user_id")?;
        require_string(&self.project_name, "project_name")?;
        require_string(&self.project_path, "project_path")?;
        Ok(())
    }
}

/// Body of `POST /activity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub project_name: String,
    pub project_path: String,
    pub activity_type: ActivityType,
    #[serde(default)]
    pub activity_source: ActivitySource,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub description: String,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ActivityRequest {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(id) = &self.id {
            validate_event_id(id)?;
        }
        require_string(&self.user_id, "user_id")?;
        require_string(&self.project_name, "project_name")?;
        require_string(&self.project_path, "project_path")?;
        parse_timestamp(&self.timestamp)?;
        Ok(())
    }

    /// Validates the request and turns it into an event. `assign_id` is only
    /// called when the client did not send an id.
    pub fn into_event(self, assign_id: impl FnOnce() -> String) -> Result<ActivityEvent, ErrorInfo> {
        self.validate()?;
        let timestamp = parse_timestamp(&self.timestamp)?;
        Ok(ActivityEvent {
            id: self.id.unwrap_or_else(assign_id),
            user_id: self.user_id,
            project_name: self.project_name,
            project_path: self.project_path,
            activity_type: self.activity_type,
            activity_source: self.activity_source,
            timestamp,
            command: self.command,
            description: self.description,
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Duplicate,
    Flagged,
}

/// Acknowledgement returned by the daemon for a delivered event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityAck {
    pub status: AckStatus,
    pub activity_id: String,
    pub timestamp: DateTime<Utc>,
}

/// One line of the hook's fallback log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub timestamp: DateTime<Utc>,
    pub event: ActivityEvent,
    pub source: String,
    pub version: String,
}

impl FallbackRecord {
    pub fn new(event: ActivityEvent, version: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            source: FALLBACK_SOURCE.to_string(),
            version: version.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub fn parse_activity(params: Value) -> Result<ActivityRequest, ErrorInfo> {
    let request: ActivityRequest = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("activity payload is invalid: {}", err),
        )
    })?;
    request.validate()?;
    Ok(request)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ErrorInfo> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ErrorInfo::new("invalid_timestamp", "timestamp must be RFC3339"))
}

fn validate_event_id(id: &str) -> Result<(), ErrorInfo> {
    if id.trim().is_empty() {
        return Err(ErrorInfo::new("invalid_event_id", "id must not be empty"));
    }
    if id.len() > MAX_EVENT_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_event_id",
            format!("id must be {} characters or fewer", MAX_EVENT_ID_LEN),
        ));
    }
    Ok(())
}

fn require_string(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}
