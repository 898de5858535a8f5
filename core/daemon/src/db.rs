//! SQLite persistence for worktime-daemon.
//!
//! Single-writer store. `events` is the append-only source of truth; the
//! `users`, `sessions`, `work_blocks` and `projects` tables are materialized
//! from it and can be rebuilt at any time. `reconciliation` holds events that
//! arrived older than their user's last applied timestamp.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::PathBuf;
use worktime_core::ProjectType;
use worktime_protocol::{ActivityEvent, ActivityType};

use crate::aggregator::Changes;
use crate::model::{EntityState, Project, Session, User, WorkBlock};

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    /// Returns false when the id was already stored.
    pub fn insert_event(&self, event: &ActivityEvent) -> Result<bool, String> {
        self.with_connection(|conn| insert_event_row(conn, event))
    }

    /// Inserts many events in one transaction; returns how many were new.
    pub fn insert_events(&self, events: &[ActivityEvent]) -> Result<usize, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin transaction: {}", err))?;
            let mut inserted = 0;
            for event in events {
                if insert_event_row(&tx, event)? {
                    inserted += 1;
                }
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit events: {}", err))?;
            Ok(inserted)
        })
    }

    pub fn has_event(&self, id: &str) -> Result<bool, String> {
        self.with_connection(|conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM events WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|err| format!("Failed to look up event: {}", err))?;
            Ok(found.is_some())
        })
    }

    pub fn list_events(&self) -> Result<Vec<ActivityEvent>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT payload FROM events ORDER BY timestamp_ms ASC, id ASC")
                .map_err(|err| format!("Failed to prepare events query: {}", err))?;

            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|err| format!("Failed to read event rows: {}", err))?;

            let mut events = Vec::new();
            for row in rows {
                let payload = row.map_err(|err| format!("Failed to decode event row: {}", err))?;
                let event: ActivityEvent = serde_json::from_str(&payload)
                    .map_err(|err| format!("Failed to parse event payload: {}", err))?;
                events.push(event);
            }

            Ok(events)
        })
    }

    pub fn count_events(&self) -> Result<u64, String> {
        self.count("events")
    }

    /// Returns false when the event was already flagged.
    pub fn insert_reconciliation(
        &self,
        event: &ActivityEvent,
        last_applied: DateTime<Utc>,
    ) -> Result<bool, String> {
        self.with_connection(|conn| {
            let payload = serde_json::to_string(event)
                .map_err(|err| format!("Failed to serialize event payload: {}", err))?;
            let changed = conn
                .execute(
                    "INSERT INTO reconciliation \
                        (event_id, user_id, timestamp, last_applied, payload, flagged_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(event_id) DO NOTHING",
                    params![
                        event.id,
                        event.user_id,
                        format_time(event.timestamp),
                        format_time(last_applied),
                        payload,
                        format_time(Utc::now())
                    ],
                )
                .map_err(|err| format!("Failed to insert reconciliation row: {}", err))?;
            Ok(changed > 0)
        })
    }

    pub fn has_reconciliation(&self, event_id: &str) -> Result<bool, String> {
        self.with_connection(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM reconciliation WHERE event_id = ?1",
                    params![event_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| format!("Failed to look up reconciliation row: {}", err))?;
            Ok(found.is_some())
        })
    }

    pub fn count_reconciliation(&self) -> Result<u64, String> {
        self.count("reconciliation")
    }

    /// Flagged events in timestamp order.
    pub fn list_reconciliation(&self) -> Result<Vec<ActivityEvent>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT payload FROM reconciliation ORDER BY timestamp ASC, event_id ASC")
                .map_err(|err| format!("Failed to prepare reconciliation query: {}", err))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|err| format!("Failed to read reconciliation rows: {}", err))?;

            let mut events = Vec::new();
            for row in rows {
                let payload =
                    row.map_err(|err| format!("Failed to decode reconciliation row: {}", err))?;
                let event: ActivityEvent = serde_json::from_str(&payload)
                    .map_err(|err| format!("Failed to parse reconciliation payload: {}", err))?;
                events.push(event);
            }
            Ok(events)
        })
    }

    /// Moves flagged events into the event log in one transaction. Returns how
    /// many reconciliation rows were cleared.
    pub fn resolve_reconciliation(&self, events: &[ActivityEvent]) -> Result<usize, String> {
        if events.is_empty() {
            return Ok(0);
        }
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin transaction: {}", err))?;
            let mut cleared = 0;
            for event in events {
                insert_event_row(&tx, event)?;
                cleared += tx
                    .execute(
                        "DELETE FROM reconciliation WHERE event_id = ?1",
                        params![event.id],
                    )
                    .map_err(|err| format!("Failed to clear reconciliation row: {}", err))?;
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit reconciliation: {}", err))?;
            Ok(cleared)
        })
    }

    /// Upserts every changed entity in a single transaction.
    pub fn persist(&self, changes: &Changes) -> Result<(), String> {
        if changes.is_empty() {
            return Ok(());
        }
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin transaction: {}", err))?;
            for user in changes.users.values() {
                upsert_user(&tx, user)?;
            }
            for session in changes.sessions.values() {
                upsert_session(&tx, session)?;
            }
            for block in changes.blocks.values() {
                upsert_work_block(&tx, block)?;
            }
            for project in changes.projects.values() {
                upsert_project(&tx, project)?;
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit changes: {}", err))
        })
    }

    /// Drops every derived row; `events` and `reconciliation` are kept.
    pub fn clear_materialized(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 DELETE FROM work_blocks;
                 DELETE FROM sessions;
                 DELETE FROM projects;
                 DELETE FROM users;
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to clear materialized tables: {}", err))
        })
    }

    pub fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, user_id, start_time, end_time, state \
                     FROM sessions WHERE user_id = ?1 ORDER BY start_time ASC",
                )
                .map_err(|err| format!("Failed to prepare sessions query: {}", err))?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(|err| format!("Failed to read session rows: {}", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                let (id, user_id, start, end, state) =
                    row.map_err(|err| format!("Failed to decode session row: {}", err))?;
                sessions.push(Session {
                    id,
                    user_id,
                    start_time: parse_time(&start)?,
                    end_time: parse_time(&end)?,
                    state: parse_state(&state)?,
                });
            }
            Ok(sessions)
        })
    }

    pub fn list_work_blocks(&self, user_id: &str) -> Result<Vec<WorkBlock>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, session_id, user_id, project_id, project_name, start_time, \
                            last_activity_time, end_time, state, activity_count, type_counts \
                     FROM work_blocks WHERE user_id = ?1 ORDER BY start_time ASC",
                )
                .map_err(|err| format!("Failed to prepare work_blocks query: {}", err))?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok(WorkBlockRow {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        user_id: row.get(2)?,
                        project_id: row.get(3)?,
                        project_name: row.get(4)?,
                        start_time: row.get(5)?,
                        last_activity_time: row.get(6)?,
                        end_time: row.get(7)?,
                        state: row.get(8)?,
                        activity_count: row.get(9)?,
                        type_counts: row.get(10)?,
                    })
                })
                .map_err(|err| format!("Failed to read work_block rows: {}", err))?;

            let mut blocks = Vec::new();
            for row in rows {
                let row = row.map_err(|err| format!("Failed to decode work_block row: {}", err))?;
                blocks.push(row.into_block()?);
            }
            Ok(blocks)
        })
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>, String> {
        self.with_connection(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, path, project_type, total_hours, total_work_blocks, \
                            last_activity_time \
                     FROM projects WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, Option<String>>(6)?,
                        ))
                    },
                )
                .optional()
                .map_err(|err| format!("Failed to query project: {}", err))?;

            let Some((id, name, path, project_type, total_hours, blocks, last)) = row else {
                return Ok(None);
            };
            Ok(Some(Project {
                id,
                name,
                path,
                project_type: ProjectType::from_str_lossy(&project_type),
                total_hours,
                total_work_blocks: blocks.max(0) as u64,
                last_activity_time: last.as_deref().map(parse_time).transpose()?,
            }))
        })
    }

    pub fn health_check(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|err| format!("Database health check failed: {}", err))?;
            Ok(())
        })
    }

    fn count(&self, table: &'static str) -> Result<u64, String> {
        self.with_connection(|conn| {
            let count = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get::<_, i64>(0)
                })
                .map_err(|err| format!("Failed to count {}: {}", table, err))?;
            Ok(count.max(0) as u64)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS events (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    timestamp_ms INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    received_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS events_by_time ON events (timestamp_ms, id);
                 CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    start_time TEXT NOT NULL,
                    end_time TEXT NOT NULL,
                    state TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS work_blocks (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    project_id TEXT NOT NULL,
                    project_name TEXT NOT NULL,
                    start_time TEXT NOT NULL,
                    last_activity_time TEXT NOT NULL,
                    end_time TEXT,
                    state TEXT NOT NULL,
                    activity_count INTEGER NOT NULL DEFAULT 0,
                    type_counts TEXT NOT NULL DEFAULT '{}'
                 );
                 CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    project_type TEXT NOT NULL,
                    total_hours REAL NOT NULL DEFAULT 0,
                    total_work_blocks INTEGER NOT NULL DEFAULT 0,
                    last_activity_time TEXT
                 );
                 CREATE TABLE IF NOT EXISTS reconciliation (
                    event_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    last_applied TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    flagged_at TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

struct WorkBlockRow {
    id: String,
    session_id: String,
    user_id: String,
    project_id: String,
    project_name: String,
    start_time: String,
    last_activity_time: String,
    end_time: Option<String>,
    state: String,
    activity_count: i64,
    type_counts: String,
}

impl WorkBlockRow {
    fn into_block(self) -> Result<WorkBlock, String> {
        let type_counts: BTreeMap<ActivityType, u64> = serde_json::from_str(&self.type_counts)
            .map_err(|err| format!("Failed to parse type_counts: {}", err))?;
        Ok(WorkBlock {
            id: self.id,
            session_id: self.session_id,
            user_id: self.user_id,
            project_id: self.project_id,
            project_name: self.project_name,
            start_time: parse_time(&self.start_time)?,
            last_activity_time: parse_time(&self.last_activity_time)?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
            state: parse_state(&self.state)?,
            activity_count: self.activity_count.max(0) as u64,
            type_counts,
        })
    }
}

fn insert_event_row(conn: &Connection, event: &ActivityEvent) -> Result<bool, String> {
    let payload = serde_json::to_string(event)
        .map_err(|err| format!("Failed to serialize event payload: {}", err))?;
    let changed = conn
        .execute(
            "INSERT INTO events (id, user_id, timestamp, timestamp_ms, payload, received_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(id) DO NOTHING",
            params![
                event.id,
                event.user_id,
                format_time(event.timestamp),
                event.timestamp.timestamp_millis(),
                payload,
                format_time(Utc::now())
            ],
        )
        .map_err(|err| format!("Failed to insert event: {}", err))?;
    Ok(changed > 0)
}

fn upsert_user(tx: &Transaction<'_>, user: &User) -> Result<(), String> {
    tx.execute(
        "INSERT INTO users (id, name, created_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        params![user.id, user.name, format_time(user.created_at)],
    )
    .map_err(|err| format!("Failed to upsert user: {}", err))?;
    Ok(())
}

fn upsert_session(tx: &Transaction<'_>, session: &Session) -> Result<(), String> {
    tx.execute(
        "INSERT INTO sessions (id, user_id, start_time, end_time, state) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(id) DO UPDATE SET \
            end_time = excluded.end_time, \
            state = excluded.state",
        params![
            session.id,
            session.user_id,
            format_time(session.start_time),
            format_time(session.end_time),
            session.state.as_str()
        ],
    )
    .map_err(|err| format!("Failed to upsert session: {}", err))?;
    Ok(())
}

fn upsert_work_block(tx: &Transaction<'_>, block: &WorkBlock) -> Result<(), String> {
    let type_counts = serde_json::to_string(&block.type_counts)
        .map_err(|err| format!("Failed to serialize type_counts: {}", err))?;
    tx.execute(
        "INSERT INTO work_blocks \
            (id, session_id, user_id, project_id, project_name, start_time, \
             last_activity_time, end_time, state, activity_count, type_counts) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
         ON CONFLICT(id) DO UPDATE SET \
            project_name = excluded.project_name, \
            last_activity_time = excluded.last_activity_time, \
            end_time = excluded.end_time, \
            state = excluded.state, \
            activity_count = excluded.activity_count, \
            type_counts = excluded.type_counts",
        params![
            block.id,
            block.session_id,
            block.user_id,
            block.project_id,
            block.project_name,
            format_time(block.start_time),
            format_time(block.last_activity_time),
            block.end_time.map(format_time),
            block.state.as_str(),
            block.activity_count as i64,
            type_counts
        ],
    )
    .map_err(|err| format!("Failed to upsert work block: {}", err))?;
    Ok(())
}

fn upsert_project(tx: &Transaction<'_>, project: &Project) -> Result<(), String> {
    tx.execute(
        "INSERT INTO projects \
            (id, name, path, project_type, total_hours, total_work_blocks, last_activity_time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(id) DO UPDATE SET \
            name = excluded.name, \
            project_type = excluded.project_type, \
            total_hours = excluded.total_hours, \
            total_work_blocks = excluded.total_work_blocks, \
            last_activity_time = excluded.last_activity_time",
        params![
            project.id,
            project.name,
            project.path,
            project.project_type.as_str(),
            project.total_hours,
            project.total_work_blocks as i64,
            project.last_activity_time.map(format_time)
        ],
    )
    .map_err(|err| format!("Failed to upsert project: {}", err))?;
    Ok(())
}

fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("Invalid stored timestamp {:?}: {}", value, err))
}

fn parse_state(value: &str) -> Result<EntityState, String> {
    EntityState::parse(value).ok_or_else(|| format!("Invalid stored state {:?}", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::{at, event};
    use crate::aggregator::{AggregatorConfig, SessionAggregator};
    use worktime_core::project_id;

    fn temp_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("worktime.db")).expect("db init");
        (temp_dir, db)
    }

    #[test]
    fn schema_includes_event_and_derived_tables() {
        let (_temp, db) = temp_db();
        let tables = db
            .with_connection(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
                    .map_err(|err| format!("Failed to query sqlite_master: {}", err))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(|err| format!("Failed to read sqlite_master rows: {}", err))?;
                let mut names = Vec::new();
                for row in rows {
                    names.push(row.map_err(|err| format!("Failed to decode table name: {}", err))?);
                }
                Ok(names)
            })
            .expect("tables");

        for table in [
            "events",
            "users",
            "sessions",
            "work_blocks",
            "projects",
            "reconciliation",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn inserting_an_event_twice_keeps_one_row() {
        let (_temp, db) = temp_db();
        let e = event("e1", "u1", "p1", at(9, 0, 0));
        assert!(db.insert_event(&e).expect("insert"));
        assert!(!db.insert_event(&e).expect("insert again"));
        assert!(db.has_event("e1").expect("has"));
        assert_eq!(db.count_events().expect("count"), 1);
    }

    #[test]
    fn lists_events_in_timestamp_order() {
        let (_temp, db) = temp_db();
        let inserted = db
            .insert_events(&[
                event("b", "u1", "p1", at(9, 5, 0)),
                event("a", "u1", "p1", at(9, 0, 0)),
                event("c", "u2", "p1", at(9, 5, 0)),
            ])
            .expect("insert");
        assert_eq!(inserted, 3);

        let ids: Vec<_> = db
            .list_events()
            .expect("list")
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn persists_and_reads_back_aggregated_entities() {
        let (_temp, db) = temp_db();
        let agg = SessionAggregator::new(AggregatorConfig::default());
        let mut changes = agg
            .apply_batch(vec![
                event("e1", "u1", "p1", at(9, 0, 0)),
                event("e2", "u1", "p1", at(9, 3, 0)),
                event("e3", "u1", "p1", at(9, 10, 0)),
            ])
            .changes;
        changes.merge(agg.sweep(at(9, 20, 0)));
        db.persist(&changes).expect("persist");

        let sessions = db.list_sessions("u1").expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].end_time, at(14, 0, 0));

        let blocks = db.list_work_blocks("u1").expect("blocks");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].end_time, Some(at(9, 3, 0)));
        assert_eq!(blocks[1].end_time, Some(at(9, 10, 0)));
        assert!(blocks.iter().all(|b| b.state == EntityState::Closed));
        assert_eq!(
            blocks[0].type_counts.get(&ActivityType::Command),
            Some(&2)
        );

        let project = db
            .get_project(&project_id("/repo/p1"))
            .expect("query")
            .expect("project");
        assert_eq!(project.total_work_blocks, 2);
        assert_eq!(project.project_type, ProjectType::Rust);
        assert!((project.total_hours - 3.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn clear_materialized_keeps_the_event_log() {
        let (_temp, db) = temp_db();
        let agg = SessionAggregator::new(AggregatorConfig::default());
        let e = event("e1", "u1", "p1", at(9, 0, 0));
        db.insert_event(&e).expect("insert");
        if let crate::aggregator::ApplyOutcome::Applied(changes) = agg.apply(&e) {
            db.persist(&changes).expect("persist");
        }
        assert_eq!(db.list_sessions("u1").expect("sessions").len(), 1);

        db.clear_materialized().expect("clear");
        assert!(db.list_sessions("u1").expect("sessions").is_empty());
        assert!(db.list_work_blocks("u1").expect("blocks").is_empty());
        assert_eq!(db.count_events().expect("count"), 1);
    }

    #[test]
    fn reconciliation_rows_are_unique_and_move_into_the_log() {
        let (_temp, db) = temp_db();
        let e = event("late", "u1", "p1", at(9, 0, 0));
        assert!(db.insert_reconciliation(&e, at(9, 10, 0)).expect("flag"));
        assert!(!db.insert_reconciliation(&e, at(9, 10, 0)).expect("flag again"));
        assert!(db.has_reconciliation("late").expect("has"));
        assert_eq!(db.count_reconciliation().expect("count"), 1);

        assert_eq!(db.list_reconciliation().expect("list"), vec![e.clone()]);
        assert_eq!(db.resolve_reconciliation(&[e]).expect("resolve"), 1);
        assert_eq!(db.count_reconciliation().expect("count"), 0);
        assert!(db.has_event("late").expect("has"));
    }

    #[test]
    fn health_check_succeeds_on_fresh_db() {
        let (_temp, db) = temp_db();
        db.health_check().expect("healthy");
        assert!(db.get_project("missing").expect("query").is_none());
    }
}
