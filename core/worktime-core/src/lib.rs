//! # worktime-core
//!
//! Shared building blocks for the worktime hook and daemon.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. The daemon wraps calls in
//!   blocking tasks where needed.
//! - **Graceful degradation**: Missing files return defaults, not errors. The
//!   project detector never fails.
//! - **Immutable configuration**: `Config` is built once per process and passed
//!   to whatever needs it.

pub mod config;
pub mod error;
pub mod fallback;
pub mod identity;
pub mod ignore;
pub mod project;

pub use config::{Config, ConfigOverrides, DaemonConfig};
pub use error::{ConfigError, FallbackError, RecordParseError, ReplayError};
pub use fallback::{FallbackLog, FallbackRecords, FallbackReplay};
pub use identity::{current_user_id, new_event_id};
pub use ignore::IgnoreMatcher;
pub use project::{project_id, ProjectDetector, ProjectInfo, ProjectType};
