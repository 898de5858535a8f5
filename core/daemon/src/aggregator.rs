//! Session and work-block derivation.
//!
//! Per-user state machine driven by events (`apply`) and by time (`sweep`).
//! Each user's state sits behind its own mutex; the user map itself is behind
//! an `RwLock`, so `status` reads for one user never wait on another user's
//! update. Projects are shared across users and have a separate lock, always
//! taken after a user lock. The daemon wraps every mutation in a single
//! writer lock (see `state.rs`), so writes are serialized across users there.
//!
//! Ordering: live `apply` rejects events older than the user's last applied
//! timestamp and only counts them; the caller stores them for reconciliation.
//! `apply_batch` sorts per user first, so replays never trip that check.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use worktime_core::{project_id, DaemonConfig, ProjectType};
use worktime_protocol::ActivityEvent;

use crate::model::{hours, Project, Session, User, WorkBlock};

pub const RECENT_ID_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub idle_timeout: Duration,
    pub session_length: Duration,
    pub recent_id_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::minutes(5),
            session_length: Duration::hours(5),
            recent_id_capacity: RECENT_ID_CAPACITY,
        }
    }
}

impl AggregatorConfig {
    pub fn from_daemon_config(config: &DaemonConfig) -> Self {
        let idle = Duration::from_std(config.idle_timeout()).unwrap_or(Duration::minutes(5));
        let session = Duration::from_std(config.session_length()).unwrap_or(Duration::hours(5));
        Self {
            idle_timeout: idle,
            session_length: session,
            recent_id_capacity: RECENT_ID_CAPACITY,
        }
    }
}

/// Entities touched by an operation, keyed by id (last write wins).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    pub users: BTreeMap<String, User>,
    pub sessions: BTreeMap<String, Session>,
    pub blocks: BTreeMap<String, WorkBlock>,
    pub projects: BTreeMap<String, Project>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.sessions.is_empty()
            && self.blocks.is_empty()
            && self.projects.is_empty()
    }

    pub fn merge(&mut self, other: Changes) {
        self.users.extend(other.users);
        self.sessions.extend(other.sessions);
        self.blocks.extend(other.blocks);
        self.projects.extend(other.projects);
    }

    fn session(&mut self, session: &Session) {
        self.sessions.insert(session.id.clone(), session.clone());
    }

    fn block(&mut self, block: &WorkBlock) {
        self.blocks.insert(block.id.clone(), block.clone());
    }

    fn project(&mut self, project: &Project) {
        self.projects.insert(project.id.clone(), project.clone());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(Changes),
    Duplicate,
    /// Older than `last_applied`; held for reconciliation, not applied.
    OutOfOrder { last_applied: DateTime<Utc> },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub applied: usize,
    pub duplicates: usize,
    pub out_of_order: usize,
    pub changes: Changes,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkBlockView {
    #[serde(flatten)]
    pub block: WorkBlock,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    pub user_id: String,
    pub session: Option<SessionView>,
    pub work_block: Option<WorkBlockView>,
    pub last_applied: Option<DateTime<Utc>>,
    pub flagged: usize,
}

struct RecentIds {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if !self.set.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

struct UserState {
    user: User,
    /// Open session only; closed ones are handed out via `Changes`.
    session: Option<Session>,
    /// Open block only.
    block: Option<WorkBlock>,
    last_applied: Option<DateTime<Utc>>,
    recent: RecentIds,
    /// Out-of-order events seen live; the events themselves are stored by the caller.
    flagged: usize,
}

pub struct SessionAggregator {
    config: AggregatorConfig,
    users: RwLock<HashMap<String, Arc<Mutex<UserState>>>>,
    projects: Mutex<HashMap<String, Project>>,
}

impl SessionAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            users: RwLock::new(HashMap::new()),
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Applies one live event.
    pub fn apply(&self, event: &ActivityEvent) -> ApplyOutcome {
        let mut changes = Changes::default();
        let handle = self.user_handle(&event.user_id, event.timestamp, &mut changes);
        let mut state = lock(&handle);
        let outcome = self.apply_locked(&mut state, event, changes);
        if let ApplyOutcome::OutOfOrder { last_applied } = &outcome {
            tracing::warn!(
                event_id = %event.id,
                user_id = %event.user_id,
                timestamp = %event.timestamp,
                last_applied = %last_applied,
                "Out-of-order event flagged for reconciliation"
            );
        }
        outcome
    }

    /// Applies many events, sorted per user by `(timestamp, id)` first.
    pub fn apply_batch(&self, events: Vec<ActivityEvent>) -> BatchSummary {
        let mut by_user: BTreeMap<String, Vec<ActivityEvent>> = BTreeMap::new();
        for event in events {
            by_user.entry(event.user_id.clone()).or_default().push(event);
        }

        let mut summary = BatchSummary::default();
        for (user_id, mut events) in by_user {
            events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
            let Some(first) = events.first() else {
                continue;
            };
            let mut created = Changes::default();
            let handle = self.user_handle(&user_id, first.timestamp, &mut created);
            summary.changes.merge(created);

            let mut state = lock(&handle);
            for event in &events {
                match self.apply_locked(&mut state, event, Changes::default()) {
                    ApplyOutcome::Applied(changes) => {
                        summary.applied += 1;
                        summary.changes.merge(changes);
                    }
                    ApplyOutcome::Duplicate => summary.duplicates += 1,
                    ApplyOutcome::OutOfOrder { .. } => summary.out_of_order += 1,
                }
            }
        }
        summary
    }

    /// Closes idle blocks and expired sessions as of `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Changes {
        let mut changes = Changes::default();
        for handle in self.user_handles() {
            let mut state = lock(&handle);

            let session_expired = state
                .session
                .as_ref()
                .map(|session| now >= session.end_time)
                .unwrap_or(false);

            if session_expired {
                self.close_block(&mut state, &mut changes);
                if let Some(mut session) = state.session.take() {
                    session.close();
                    tracing::info!(session_id = %session.id, user_id = %session.user_id, "Session closed by sweep");
                    changes.session(&session);
                }
                continue;
            }

            let block_idle = state
                .block
                .as_ref()
                .map(|block| now - block.last_activity_time >= self.config.idle_timeout)
                .unwrap_or(false);
            if block_idle {
                self.close_block(&mut state, &mut changes);
            }
        }
        changes
    }

    pub fn user_status(&self, user_id: &str, now: DateTime<Utc>) -> Option<UserStatus> {
        let handle = self.existing_user(user_id)?;
        let state = lock(&handle);
        Some(UserStatus {
            user_id: state.user.id.clone(),
            session: state.session.as_ref().map(|session| SessionView {
                session: session.clone(),
                duration_secs: session.duration(now).num_seconds(),
            }),
            work_block: state.block.as_ref().map(|block| WorkBlockView {
                block: block.clone(),
                duration_secs: block.duration(now).num_seconds(),
            }),
            last_applied: state.last_applied,
            flagged: state.flagged,
        })
    }

    pub fn flagged_count(&self) -> usize {
        self.user_handles()
            .iter()
            .map(|handle| lock(handle).flagged)
            .sum()
    }

    pub fn user_count(&self) -> usize {
        read_users(&self.users).len()
    }

    #[cfg(test)]
    pub fn project(&self, id: &str) -> Option<Project> {
        lock(&self.projects).get(id).cloned()
    }

    fn apply_locked(
        &self,
        state: &mut UserState,
        event: &ActivityEvent,
        mut changes: Changes,
    ) -> ApplyOutcome {
        if state.recent.contains(&event.id) {
            return ApplyOutcome::Duplicate;
        }
        if let Some(last_applied) = state.last_applied {
            if event.timestamp < last_applied {
                state.flagged += 1;
                return ApplyOutcome::OutOfOrder { last_applied };
            }
        }

        let at = event.timestamp;
        let needs_session = state
            .session
            .as_ref()
            .map(|session| at > session.end_time)
            .unwrap_or(true);

        if needs_session {
            self.close_block(state, &mut changes);
            if let Some(mut previous) = state.session.take() {
                previous.close();
                changes.session(&previous);
            }
            let session = Session::open(&state.user.id, at, self.config.session_length);
            tracing::debug!(session_id = %session.id, user_id = %session.user_id, "Session opened");
            state.session = Some(session);
        }

        let project_path = normalize_project_path(&event.project_path);
        let project_key = project_id(&project_path);
        let extends = state
            .block
            .as_ref()
            .map(|block| {
                block.project_id == project_key
                    && at - block.last_activity_time < self.config.idle_timeout
            })
            .unwrap_or(false);

        if !extends {
            // One project at a time: any open block ends here.
            self.close_block(state, &mut changes);
            if let Some(session) = state.session.as_ref() {
                let block = WorkBlock::open(session, &project_key, &event.project_name, at);
                tracing::debug!(block_id = %block.id, project_id = %project_key, "Work block opened");
                state.block = Some(block);
            }
        }

        {
            let mut projects = lock(&self.projects);
            let project = projects.entry(project_key.clone()).or_insert_with(|| {
                Project::new(
                    &project_key,
                    &event.project_name,
                    &project_path,
                    event
                        .metadata
                        .get("project_type")
                        .map(|value| ProjectType::from_str_lossy(value))
                        .unwrap_or_default(),
                )
            });
            project.name = event.project_name.clone();
            if !extends {
                project.total_work_blocks += 1;
            }
            project.last_activity_time = Some(
                project
                    .last_activity_time
                    .map_or(at, |previous| previous.max(at)),
            );
            changes.project(project);
        }

        if let Some(block) = state.block.as_mut() {
            block.record(at, event.activity_type);
            changes.block(block);
        }
        if let Some(session) = state.session.as_ref() {
            changes.session(session);
        }

        state.last_applied = Some(at);
        state.recent.insert(&event.id);
        ApplyOutcome::Applied(changes)
    }

    fn close_block(&self, state: &mut UserState, changes: &mut Changes) {
        let Some(mut block) = state.block.take() else {
            return;
        };
        block.close();
        tracing::debug!(block_id = %block.id, end_time = ?block.end_time, "Work block closed");

        let mut projects = lock(&self.projects);
        if let Some(project) = projects.get_mut(&block.project_id) {
            project.total_hours += hours(block.duration(block.last_activity_time));
            changes.project(project);
        }
        changes.block(&block);
    }

    fn user_handle(
        &self,
        user_id: &str,
        first_seen: DateTime<Utc>,
        changes: &mut Changes,
    ) -> Arc<Mutex<UserState>> {
        if let Some(handle) = self.existing_user(user_id) {
            return handle;
        }

        let mut users = match self.users.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let capacity = self.config.recent_id_capacity;
        Arc::clone(users.entry(user_id.to_string()).or_insert_with(|| {
            let user = User {
                id: user_id.to_string(),
                name: user_id.to_string(),
                created_at: first_seen,
            };
            changes.users.insert(user.id.clone(), user.clone());
            Arc::new(Mutex::new(UserState {
                user,
                session: None,
                block: None,
                last_applied: None,
                recent: RecentIds::new(capacity),
                flagged: 0,
            }))
        }))
    }

    fn existing_user(&self, user_id: &str) -> Option<Arc<Mutex<UserState>>> {
        read_users(&self.users).get(user_id).cloned()
    }

    fn user_handles(&self) -> Vec<Arc<Mutex<UserState>>> {
        read_users(&self.users).values().cloned().collect()
    }
}

fn normalize_project_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

// A panic while holding a lock leaves the state as it was at the panic; keep
// serving rather than poisoning every later request.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_users(
    users: &RwLock<HashMap<String, Arc<Mutex<UserState>>>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<UserState>>>> {
    match users.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::EntityState;
    use chrono::TimeZone;
    use worktime_protocol::{ActivitySource, ActivityType};

    pub(crate) fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 30, h, m, s).unwrap()
    }

    pub(crate) fn event(id: &str, user: &str, project: &str, ts: DateTime<Utc>) -> ActivityEvent {
        ActivityEvent {
            id: id.to_string(),
            user_id: user.to_string(),
            project_name: project.to_string(),
            project_path: format!("/repo/{project}"),
            activity_type: ActivityType::Command,
            activity_source: ActivitySource::Hook,
            timestamp: ts,
            command: String::new(),
            description: String::new(),
            metadata: BTreeMap::from([("project_type".to_string(), "rust".to_string())]),
        }
    }

    fn applied(outcome: ApplyOutcome) -> Changes {
        match outcome {
            ApplyOutcome::Applied(changes) => changes,
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    fn blocks_for(changes: &Changes) -> Vec<WorkBlock> {
        let mut blocks: Vec<_> = changes.blocks.values().cloned().collect();
        blocks.sort_by_key(|b| b.start_time);
        blocks
    }

    #[test]
    fn close_events_form_one_block_spanning_first_to_last() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        let mut all = Changes::default();
        for (i, minute) in [0, 4, 8, 12, 16].iter().enumerate() {
            all.merge(applied(agg.apply(&event(&format!("e{i}"), "u1", "p1", at(9, *minute, 0)))));
        }

        let blocks = blocks_for(&all);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start_time, at(9, 0, 0));
        assert_eq!(blocks[0].last_activity_time, at(9, 16, 0));
        assert_eq!(blocks[0].activity_count, 5);
        assert_eq!(blocks[0].state, EntityState::Active);
    }

    #[test]
    fn seven_minute_gap_splits_blocks() {
        // 09:00, 09:03, then 09:10 after a 7-minute gap.
        let agg = SessionAggregator::new(AggregatorConfig::default());
        let mut all = Changes::default();
        all.merge(applied(agg.apply(&event("e1", "u1", "p1", at(9, 0, 0)))));
        all.merge(applied(agg.apply(&event("e2", "u1", "p1", at(9, 3, 0)))));
        all.merge(applied(agg.apply(&event("e3", "u1", "p1", at(9, 10, 0)))));

        let blocks = blocks_for(&all);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].start_time, at(9, 0, 0));
        assert_eq!(blocks[0].end_time, Some(at(9, 3, 0)));
        assert_eq!(blocks[0].state, EntityState::Closed);
        assert_eq!(blocks[1].start_time, at(9, 10, 0));
        assert_eq!(blocks[1].end_time, None);
        assert_eq!(blocks[1].state, EntityState::Active);
        // Both blocks belong to the same session.
        assert_eq!(blocks[0].session_id, blocks[1].session_id);
    }

    #[test]
    fn exactly_idle_timeout_gap_starts_new_block() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        let mut all = Changes::default();
        all.merge(applied(agg.apply(&event("e1", "u1", "p1", at(9, 0, 0)))));
        all.merge(applied(agg.apply(&event("e2", "u1", "p1", at(9, 5, 0)))));
        assert_eq!(blocks_for(&all).len(), 2);
    }

    #[test]
    fn sweep_closes_idle_block_without_new_events() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        agg.apply(&event("e1", "u1", "p1", at(9, 0, 0)));
        agg.apply(&event("e2", "u1", "p1", at(9, 2, 0)));

        assert!(agg.sweep(at(9, 6, 59)).blocks.is_empty());

        let swept = agg.sweep(at(9, 7, 0));
        let blocks = blocks_for(&swept);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].state, EntityState::Closed);
        assert_eq!(blocks[0].end_time, Some(at(9, 2, 0)));

        let status = agg.user_status("u1", at(9, 8, 0)).expect("status");
        assert!(status.work_block.is_none());
        assert!(status.session.is_some(), "session stays open after block sweep");

        let project = agg.project(&project_id("/repo/p1")).expect("project");
        assert!((project.total_hours - 2.0 / 60.0).abs() < 1e-9);
        assert_eq!(project.total_work_blocks, 1);
    }

    #[test]
    fn event_after_session_end_opens_second_session_with_fixed_ends() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        let t0 = at(9, 0, 0);
        let mut all = Changes::default();
        all.merge(applied(agg.apply(&event("e1", "u1", "p1", t0))));
        all.merge(applied(agg.apply(&event(
            "e2",
            "u1",
            "p1",
            t0 + Duration::hours(5) + Duration::seconds(1),
        ))));

        let mut sessions: Vec<_> = all.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.start_time);
        assert_eq!(sessions.len(), 2);
        for session in &sessions {
            assert_eq!(session.end_time, session.start_time + Duration::hours(5));
        }
        assert_eq!(sessions[0].state, EntityState::Closed);
        assert_eq!(sessions[1].state, EntityState::Active);

        let blocks = blocks_for(&all);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].session_id, sessions[0].id);
        assert_eq!(blocks[0].state, EntityState::Closed);
        assert_eq!(blocks[0].end_time, Some(blocks[0].last_activity_time));
        assert_eq!(blocks[0].end_time, Some(t0));
        assert_eq!(blocks[1].session_id, sessions[1].id);
        assert_eq!(blocks[1].state, EntityState::Active);
    }

    #[test]
    fn event_exactly_at_session_end_stays_in_session() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        let t0 = at(9, 0, 0);
        let first = applied(agg.apply(&event("e1", "u1", "p1", t0)));
        let second = applied(agg.apply(&event("e2", "u1", "p1", t0 + Duration::hours(5))));
        let first_id = first.sessions.keys().next().cloned();
        assert_eq!(second.sessions.keys().next().cloned(), first_id);
    }

    #[test]
    fn sweep_closes_expired_session_and_its_block() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        agg.apply(&event("e1", "u1", "p1", at(9, 0, 0)));

        let swept = agg.sweep(at(14, 0, 0));
        assert_eq!(swept.sessions.len(), 1);
        assert!(swept.sessions.values().all(|s| s.state == EntityState::Closed));
        assert!(swept.blocks.values().all(|b| b.state == EntityState::Closed));

        let status = agg.user_status("u1", at(14, 0, 1)).expect("status");
        assert!(status.session.is_none());
        assert!(status.work_block.is_none());
    }

    #[test]
    fn project_switch_closes_previous_block_immediately() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        let mut all = Changes::default();
        all.merge(applied(agg.apply(&event("e1", "u1", "api", at(9, 0, 0)))));
        all.merge(applied(agg.apply(&event("e2", "u1", "api", at(9, 1, 0)))));
        all.merge(applied(agg.apply(&event("e3", "u1", "web", at(9, 2, 0)))));

        let blocks = blocks_for(&all);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].project_name, "api");
        assert_eq!(blocks[0].end_time, Some(at(9, 1, 0)));
        assert_eq!(blocks[1].project_name, "web");
        assert_eq!(blocks[1].state, EntityState::Active);
    }

    #[test]
    fn duplicate_id_is_a_no_op() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        let e = event("e1", "u1", "p1", at(9, 0, 0));
        applied(agg.apply(&e));
        assert_eq!(agg.apply(&e), ApplyOutcome::Duplicate);

        let status = agg.user_status("u1", at(9, 1, 0)).expect("status");
        assert_eq!(status.work_block.expect("block").block.activity_count, 1);
    }

    #[test]
    fn out_of_order_live_event_is_flagged_not_applied() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        applied(agg.apply(&event("e1", "u1", "p1", at(9, 10, 0))));
        let outcome = agg.apply(&event("e0", "u1", "p1", at(9, 0, 0)));
        assert_eq!(
            outcome,
            ApplyOutcome::OutOfOrder {
                last_applied: at(9, 10, 0)
            }
        );

        let status = agg.user_status("u1", at(9, 11, 0)).expect("status");
        assert_eq!(status.flagged, 1);
        assert_eq!(status.last_applied, Some(at(9, 10, 0)));
        let block = status.work_block.expect("block").block;
        assert_eq!(block.start_time, at(9, 10, 0));
        assert_eq!(block.activity_count, 1);
        assert_eq!(agg.flagged_count(), 1);
    }

    #[test]
    fn equal_timestamps_are_in_order() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        applied(agg.apply(&event("e1", "u1", "p1", at(9, 0, 0))));
        applied(agg.apply(&event("e2", "u1", "p1", at(9, 0, 0))));
    }

    #[test]
    fn batch_sorts_per_user_before_applying() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        let summary = agg.apply_batch(vec![
            event("e3", "u1", "p1", at(9, 10, 0)),
            event("b1", "u2", "p2", at(8, 0, 0)),
            event("e1", "u1", "p1", at(9, 0, 0)),
            event("e2", "u1", "p1", at(9, 3, 0)),
        ]);

        assert_eq!(summary.applied, 4);
        assert_eq!(summary.out_of_order, 0);
        let u1_blocks: Vec<_> = blocks_for(&summary.changes)
            .into_iter()
            .filter(|b| b.user_id == "u1")
            .collect();
        assert_eq!(u1_blocks.len(), 2);
        assert_eq!(u1_blocks[0].end_time, Some(at(9, 3, 0)));
        assert_eq!(summary.changes.users.len(), 2);
    }

    #[test]
    fn replaying_twice_equals_replaying_once() {
        let events = vec![
            event("e1", "u1", "p1", at(9, 0, 0)),
            event("e2", "u1", "p1", at(9, 3, 0)),
            event("e3", "u1", "p2", at(9, 10, 0)),
        ];

        let once = SessionAggregator::new(AggregatorConfig::default());
        once.apply_batch(events.clone());

        let twice = SessionAggregator::new(AggregatorConfig::default());
        twice.apply_batch(events.clone());
        let second = twice.apply_batch(events);
        assert_eq!(second.applied, 0);
        assert_eq!(second.duplicates, 3);

        let now = at(9, 12, 0);
        let a = once.user_status("u1", now).expect("status");
        let b = twice.user_status("u1", now).expect("status");
        assert_eq!(a.work_block.map(|v| v.block), b.work_block.map(|v| v.block));
        assert_eq!(a.session.map(|v| v.session), b.session.map(|v| v.session));
        assert_eq!(
            once.project(&project_id("/repo/p1")),
            twice.project(&project_id("/repo/p1"))
        );
    }

    #[test]
    fn recent_ids_evict_oldest_beyond_capacity() {
        let mut recent = RecentIds::new(2);
        recent.insert("a");
        recent.insert("b");
        recent.insert("a");
        recent.insert("c");
        assert!(!recent.contains("a"));
        assert!(recent.contains("b"));
        assert!(recent.contains("c"));
    }

    #[test]
    fn users_are_independent() {
        let agg = SessionAggregator::new(AggregatorConfig::default());
        applied(agg.apply(&event("e1", "u1", "p1", at(9, 10, 0))));
        // Older than u1's last event, but u2 has no history.
        applied(agg.apply(&event("e2", "u2", "p1", at(9, 0, 0))));
        assert_eq!(agg.user_count(), 2);
        assert!(agg.user_status("nobody", at(9, 0, 0)).is_none());
    }

    #[test]
    fn concurrent_applies_for_many_users() {
        let agg = Arc::new(SessionAggregator::new(AggregatorConfig::default()));
        let handles: Vec<_> = (0..8)
            .map(|u| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for i in 0..50u32 {
                        let ts = at(9, 0, 0) + Duration::seconds(i64::from(i) * 10);
                        agg.apply(&event(&format!("u{u}-e{i}"), &format!("u{u}"), "p1", ts));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        for u in 0..8 {
            let status = agg.user_status(&format!("u{u}"), at(9, 10, 0)).expect("status");
            assert_eq!(status.work_block.expect("block").block.activity_count, 50);
        }
        let project = agg.project(&project_id("/repo/p1")).expect("project");
        assert_eq!(project.total_work_blocks, 8);
    }
}
