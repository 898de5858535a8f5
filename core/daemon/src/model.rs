//! Entities the aggregator derives from activity events.
//!
//! Durations are never stored. They are computed from timestamps on read, so
//! they cannot drift from the times they describe.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use worktime_core::ProjectType;
use worktime_protocol::ActivityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Active,
    Closed,
}

impl EntityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityState::Active => "active",
            EntityState::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(EntityState::Active),
            "closed" => Some(EntityState::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Fixed-length tracking window anchored at the first activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    /// `start_time + session length`; never extended.
    pub end_time: DateTime<Utc>,
    pub state: EntityState,
}

impl Session {
    pub fn open(user_id: &str, start_time: DateTime<Utc>, length: Duration) -> Self {
        Self {
            id: derive_id("ses", &[user_id, &start_time.timestamp_millis().to_string()]),
            user_id: user_id.to_string(),
            start_time,
            end_time: start_time + length,
            state: EntityState::Active,
        }
    }

    pub fn close(&mut self) {
        self.state = EntityState::Closed;
    }

    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        match self.state {
            EntityState::Closed => self.end_time - self.start_time,
            EntityState::Active => now - self.start_time,
        }
    }
}

/// Contiguous work on one project inside one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkBlock {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub project_id: String,
    pub project_name: String,
    pub start_time: DateTime<Utc>,
    pub last_activity_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub state: EntityState,
    pub activity_count: u64,
    pub type_counts: BTreeMap<ActivityType, u64>,
}

impl WorkBlock {
    pub fn open(
        session: &Session,
        project_id: &str,
        project_name: &str,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: derive_id(
                "blk",
                &[
                    &session.user_id,
                    project_id,
                    &start_time.timestamp_millis().to_string(),
                ],
            ),
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            project_id: project_id.to_string(),
            project_name: project_name.to_string(),
            start_time,
            last_activity_time: start_time,
            end_time: None,
            state: EntityState::Active,
            activity_count: 0,
            type_counts: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>, activity_type: ActivityType) {
        self.last_activity_time = at;
        self.activity_count += 1;
        *self.type_counts.entry(activity_type).or_insert(0) += 1;
    }

    /// Work stops at the last observed activity, whatever closed the block.
    pub fn close(&mut self) {
        self.end_time = Some(self.last_activity_time);
        self.state = EntityState::Closed;
    }

    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        match (self.state, self.end_time) {
            (EntityState::Closed, Some(end)) => end - self.start_time,
            (EntityState::Closed, None) => self.last_activity_time - self.start_time,
            (EntityState::Active, _) => now - self.start_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub project_type: ProjectType,
    pub total_hours: f64,
    pub total_work_blocks: u64,
    pub last_activity_time: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(id: &str, name: &str, path: &str, project_type: ProjectType) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            project_type,
            total_hours: 0.0,
            total_work_blocks: 0,
            last_activity_time: None,
        }
    }
}

pub fn hours(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 3_600_000.0
}

/// Deterministic ids so a rebuild from the event log reproduces the same rows.
fn derive_id(prefix: &str, parts: &[&str]) -> String {
    format!("{}-{:x}", prefix, md5::compute(parts.join("|")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 30, h, m, 0).unwrap()
    }

    #[test]
    fn session_end_is_fixed_at_open() {
        let session = Session::open("u1", at(9, 0), Duration::hours(5));
        assert_eq!(session.end_time, at(14, 0));
        assert_eq!(session.duration(at(10, 0)), Duration::hours(1));

        let mut closed = session.clone();
        closed.close();
        assert_eq!(closed.duration(at(20, 0)), Duration::hours(5));
    }

    #[test]
    fn closed_block_ends_at_last_activity() {
        let session = Session::open("u1", at(9, 0), Duration::hours(5));
        let mut block = WorkBlock::open(&session, "p1", "p1", at(9, 0));
        block.record(at(9, 0), ActivityType::Command);
        block.record(at(9, 3), ActivityType::Edit);
        block.close();

        assert_eq!(block.end_time, Some(at(9, 3)));
        assert_eq!(block.duration(at(12, 0)), Duration::minutes(3));
        assert_eq!(block.activity_count, 2);
        assert_eq!(block.type_counts.get(&ActivityType::Edit), Some(&1));
    }

    #[test]
    fn ids_are_deterministic() {
        let a = Session::open("u1", at(9, 0), Duration::hours(5));
        let b = Session::open("u1", at(9, 0), Duration::hours(5));
        let c = Session::open("u2", at(9, 0), Duration::hours(5));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert!(a.id.starts_with("ses-"));
    }

    #[test]
    fn hours_converts_fractionally() {
        assert!((hours(Duration::minutes(90)) - 1.5).abs() < f64::EPSILON);
    }
}
