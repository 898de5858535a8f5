//! State shared by the HTTP handlers and the sweep task.
//!
//! The aggregator holds the live per-user view; SQLite holds the event log
//! and the materialized entities. Every mutation goes through `writer` so the
//! order in which changes are computed is the order in which they are stored.
//! That lock is global: ingests and sweeps run one at a time across all users,
//! and SQLite takes a single writer anyway. Reads (`status`, `health`,
//! `history`) do not take it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use worktime_core::FallbackLog;
use worktime_protocol::{AckStatus, ActivityEvent};

use crate::aggregator::{AggregatorConfig, ApplyOutcome, SessionAggregator, UserStatus};
use crate::db::Db;
use crate::model::{Project, Session, WorkBlock};
use crate::replay::{rebuild_from_events, ReplayReport};

pub struct SharedState {
    db: Db,
    aggregator: SessionAggregator,
    writer: Mutex<()>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub pid: u32,
    pub uptime_secs: i64,
    pub database: String,
    pub events: u64,
    pub flagged: u64,
    pub users: usize,
}

/// Stored history for one user, as reporting reads it.
#[derive(Debug, Clone, Serialize)]
pub struct UserHistory {
    pub user_id: String,
    pub sessions: Vec<Session>,
    pub work_blocks: Vec<WorkBlock>,
}

impl SharedState {
    /// Builds state and replays the stored event log (plus any fallback-logged
    /// events the daemon never received) into it.
    pub fn new(db: Db, config: AggregatorConfig, fallback: Option<&FallbackLog>) -> Self {
        let state = Self {
            db,
            aggregator: SessionAggregator::new(config),
            writer: Mutex::new(()),
            started_at: Utc::now(),
        };

        match rebuild_from_events(&state.db, &state.aggregator, fallback, Utc::now()) {
            Ok(report) => log_replay(&report),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to rebuild state from events");
            }
        }

        state
    }

    #[cfg(test)]
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Applies one live event and stores the result. Errors mean nothing
    /// durable was recorded and the client should keep the event.
    pub fn ingest(&self, event: &ActivityEvent) -> Result<AckStatus, String> {
        let _writer = self.write_guard();

        if self.db.has_event(&event.id)? {
            return Ok(AckStatus::Duplicate);
        }
        if self.db.has_reconciliation(&event.id)? {
            return Ok(AckStatus::Flagged);
        }

        match self.aggregator.apply(event) {
            ApplyOutcome::Duplicate => {
                // Applied in memory by an earlier attempt whose insert failed.
                self.db.insert_event(event)?;
                tracing::info!(event_id = %event.id, "Stored event applied by an earlier attempt");
                Ok(AckStatus::Accepted)
            }
            ApplyOutcome::OutOfOrder { last_applied } => {
                self.db.insert_reconciliation(event, last_applied)?;
                Ok(AckStatus::Flagged)
            }
            ApplyOutcome::Applied(changes) => {
                self.db.insert_event(event)?;
                if let Err(err) = self.db.persist(&changes) {
                    // The event is in the log, so the next rebuild restores these rows.
                    tracing::warn!(event_id = %event.id, error = %err, "Failed to persist derived state");
                }
                tracing::debug!(
                    event_id = %event.id,
                    user_id = %event.user_id,
                    project = %event.project_name,
                    "Activity applied"
                );
                Ok(AckStatus::Accepted)
            }
        }
    }

    /// Closes idle blocks and expired sessions. Returns how many entities changed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, String> {
        let _writer = self.write_guard();
        let changes = self.aggregator.sweep(now);
        let changed = changes.sessions.len() + changes.blocks.len();
        self.db.persist(&changes)?;
        if changed > 0 {
            tracing::info!(
                sessions = changes.sessions.len(),
                work_blocks = changes.blocks.len(),
                "Sweep closed idle entities"
            );
        }
        Ok(changed)
    }

    pub fn status(&self, user_id: &str, now: DateTime<Utc>) -> Option<UserStatus> {
        self.aggregator.user_status(user_id, now)
    }

    pub fn history(&self, user_id: &str) -> Result<UserHistory, String> {
        Ok(UserHistory {
            user_id: user_id.to_string(),
            sessions: self.db.list_sessions(user_id)?,
            work_blocks: self.db.list_work_blocks(user_id)?,
        })
    }

    pub fn project(&self, id: &str) -> Result<Option<Project>, String> {
        self.db.get_project(id)
    }

    pub fn health(&self, now: DateTime<Utc>) -> HealthReport {
        let database = match self.db.health_check() {
            Ok(()) => "ok".to_string(),
            Err(err) => {
                tracing::warn!(error = %err, "Database health check failed");
                err
            }
        };
        let events = self.db.count_events().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Failed to count events");
            0
        });
        let flagged = self.db.count_reconciliation().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Failed to count flagged events");
            self.aggregator.flagged_count() as u64
        });

        HealthReport {
            status: if database == "ok" { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            pid: std::process::id(),
            uptime_secs: (now - self.started_at).num_seconds().max(0),
            database,
            events,
            flagged,
            users: self.aggregator.user_count(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.db.health_check().is_ok()
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn log_replay(report: &ReplayReport) {
    tracing::info!(
        stored = report.stored,
        imported = report.imported,
        reconciled = report.reconciled,
        applied = report.applied,
        duplicates = report.duplicates,
        out_of_order = report.out_of_order,
        skipped = report.skipped,
        "Rebuilt state from event log"
    );
}
