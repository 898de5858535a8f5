//! Durable, append-only record of events that could not be delivered.
//!
//! One JSON object per line. Each record goes out in a single `write_all` on
//! a file opened in append mode, then `sync_data`, so overlapping hook
//! processes interleave at line granularity without tearing a record.
//!
//! Replay never truncates or rewrites the file; it can be run any number of
//! times.

use crate::error::{FallbackError, RecordParseError, ReplayError};
use fs_err as fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use worktime_protocol::{ActivityEvent, FallbackRecord};

#[derive(Debug, Clone)]
pub struct FallbackLog {
    path: PathBuf,
    version: String,
}

impl FallbackLog {
    /// `version` is stamped on every record (usually the writer's crate version).
    pub fn new(path: impl Into<PathBuf>, version: &str) -> Self {
        Self {
            path: path.into(),
            version: version.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &ActivityEvent) -> Result<(), FallbackError> {
        let record = FallbackRecord::new(event.clone(), &self.version);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| self.write_error(source))?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.write_error(source))?;
        file.write_all(&line)
            .map_err(|source| self.write_error(source))?;
        file.sync_data().map_err(|source| self.write_error(source))?;
        Ok(())
    }

    /// Decoded records in file order, including malformed ones as errors.
    /// A missing file yields an empty sequence.
    pub fn records(&self) -> Result<FallbackRecords, ReplayError> {
        if !self.path.exists() {
            return Ok(FallbackRecords { reader: None, line: 0 });
        }
        let file = fs::File::open(&self.path).map_err(|source| ReplayError::Read {
            path: self.path.clone(),
            source,
        })?;
        Ok(FallbackRecords {
            reader: Some(BufReader::new(file)),
            line: 0,
        })
    }

    /// Events in file order. Malformed lines are skipped with a warning.
    pub fn replay_all(&self) -> Result<FallbackReplay, ReplayError> {
        Ok(FallbackReplay {
            records: self.records()?,
            skipped: 0,
        })
    }

    fn write_error(&self, source: std::io::Error) -> FallbackError {
        FallbackError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

/// Lazy iterator over raw records. Blank lines are skipped silently.
pub struct FallbackRecords {
    reader: Option<BufReader<fs::File>>,
    line: usize,
}

impl Iterator for FallbackRecords {
    type Item = Result<FallbackRecord, RecordParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        loop {
            let mut buf = String::new();
            self.line += 1;
            match reader.read_line(&mut buf) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    // Invalid UTF-8 costs one line; anything else ends the replay.
                    if err.kind() != std::io::ErrorKind::InvalidData {
                        self.reader = None;
                    }
                    return Some(Err(RecordParseError {
                        line: self.line,
                        details: err.to_string(),
                    }));
                }
            }

            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            let parsed = serde_json::from_str::<FallbackRecord>(trimmed)
                .map_err(|err| err.to_string())
                .and_then(|record| match record.event.validate() {
                    Ok(()) => Ok(record),
                    Err(info) => Err(info.to_string()),
                });
            return Some(parsed.map_err(|details| RecordParseError {
                line: self.line,
                details,
            }));
        }
    }
}

/// Lazy iterator over replayable events.
pub struct FallbackReplay {
    records: FallbackRecords,
    skipped: usize,
}

impl FallbackReplay {
    /// Number of malformed lines passed over so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for FallbackReplay {
    type Item = ActivityEvent;

    fn next(&mut self) -> Option<Self::Item> {
        for result in self.records.by_ref() {
            match result {
                Ok(record) => return Some(record.event),
                Err(err) => {
                    self.skipped += 1;
                    tracing::warn!(line = err.line, error = %err.details, "Skipping malformed fallback record");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::tempdir;
    use worktime_protocol::{ActivitySource, ActivityType};

    fn event(id: &str) -> ActivityEvent {
        ActivityEvent {
            id: id.to_string(),
            user_id: "u1".to_string(),
            project_name: "p1".to_string(),
            project_path: "/repo/p1".to_string(),
            activity_type: ActivityType::Command,
            activity_source: ActivitySource::Hook,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 30, 9, 0, 0).unwrap(),
            command: "cargo build".to_string(),
            description: "build".to_string(),
            metadata: BTreeMap::from([("platform".to_string(), "linux".to_string())]),
        }
    }

    #[test]
    fn append_creates_parent_dirs_and_writes_one_line_per_event() {
        let temp = tempdir().expect("temp dir");
        let log = FallbackLog::new(temp.path().join("logs").join("fallback.log"), "0.1.0");

        log.append(&event("evt-1")).expect("append 1");
        log.append(&event("evt-2")).expect("append 2");

        let contents = std::fs::read_to_string(log.path()).expect("read");
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.ends_with('\n'));

        let first: serde_json::Value =
            serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(first["source"], "hook_fallback");
        assert_eq!(first["version"], "0.1.0");
        assert_eq!(first["event"]["id"], "evt-1");
    }

    #[test]
    fn replay_yields_events_in_file_order() {
        let temp = tempdir().expect("temp dir");
        let log = FallbackLog::new(temp.path().join("fallback.log"), "0.1.0");
        for id in ["evt-a", "evt-b", "evt-c"] {
            log.append(&event(id)).expect("append");
        }

        let ids: Vec<String> = log.replay_all().expect("replay").map(|e| e.id).collect();
        assert_eq!(ids, vec!["evt-a", "evt-b", "evt-c"]);
    }

    #[test]
    fn replay_skips_malformed_and_blank_lines() {
        let temp = tempdir().expect("temp dir");
        let log = FallbackLog::new(temp.path().join("fallback.log"), "0.1.0");
        log.append(&event("evt-1")).expect("append");
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(log.path())
                .expect("open");
            writeln!(file, "{{not json").expect("garbage");
            writeln!(file).expect("blank");
            writeln!(file, "{{\"timestamp\":\"2026-01-30T09:00:00Z\"}}").expect("partial");
        }
        log.append(&event("evt-2")).expect("append");

        let mut replay = log.replay_all().expect("replay");
        let ids: Vec<String> = replay.by_ref().map(|e| e.id).collect();
        assert_eq!(ids, vec!["evt-1", "evt-2"]);
        assert_eq!(replay.skipped(), 2);
    }

    #[test]
    fn replay_is_restartable_and_leaves_file_untouched() {
        let temp = tempdir().expect("temp dir");
        let log = FallbackLog::new(temp.path().join("fallback.log"), "0.1.0");
        log.append(&event("evt-1")).expect("append");
        let before = std::fs::read(log.path()).expect("read");

        let first: Vec<_> = log.replay_all().expect("replay").collect();
        let second: Vec<_> = log.replay_all().expect("replay").collect();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(log.path()).expect("read"), before);
    }

    #[test]
    fn replay_of_missing_file_is_empty() {
        let temp = tempdir().expect("temp dir");
        let log = FallbackLog::new(temp.path().join("absent.log"), "0.1.0");
        assert_eq!(log.replay_all().expect("replay").count(), 0);
    }

    #[test]
    fn round_trip_preserves_event_fields() {
        let temp = tempdir().expect("temp dir");
        let log = FallbackLog::new(temp.path().join("fallback.log"), "0.1.0");
        let original = event("evt-1");
        log.append(&original).expect("append");

        let replayed: Vec<_> = log.replay_all().expect("replay").collect();
        assert_eq!(replayed, vec![original]);
    }

    #[test]
    fn concurrent_appends_do_not_tear_lines() {
        let temp = tempdir().expect("temp dir");
        let log = Arc::new(FallbackLog::new(temp.path().join("fallback.log"), "0.1.0"));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        log.append(&event(&format!("evt-{t}-{i}"))).expect("append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let mut replay = log.replay_all().expect("replay");
        assert_eq!(replay.by_ref().count(), 200);
        assert_eq!(replay.skipped(), 0);
    }

    #[test]
    fn unwritable_target_reports_error() {
        let temp = tempdir().expect("temp dir");
        // The "parent" is a regular file, so the log cannot be created.
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "").expect("blocker");
        let log = FallbackLog::new(blocker.join("fallback.log"), "0.1.0");

        assert!(matches!(
            log.append(&event("evt-1")),
            Err(FallbackError::Write { .. })
        ));
    }
}
