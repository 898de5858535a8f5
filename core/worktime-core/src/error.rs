//! Error types for worktime-core operations.

use std::path::PathBuf;

/// Errors raised while loading configuration.
///
/// Callers on the capture path never surface these; they fall back to
/// built-in defaults (see [`crate::config::load_config_or_default`]).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file unreadable: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("Invalid ignore pattern {pattern}: {details}")]
    InvalidPattern { pattern: String, details: String },
}

/// Errors raised while appending to the fallback log.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("Fallback log write failed: {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Fallback record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors that stop a replay before it starts.
///
/// Malformed individual lines are not errors at this level; they are skipped.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Fallback log unreadable: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single fallback-log line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed fallback record at line {line}: {details}")]
pub struct RecordParseError {
    pub line: usize,
    pub details: String,
}
