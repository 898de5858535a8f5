//! Re-delivery of fallback-logged events once the daemon is reachable.
//!
//! The log is read, never rewritten. Running this twice is harmless: the
//! daemon acknowledges already-applied ids as duplicates.

use crate::daemon_client::Deliver;
use worktime_core::FallbackLog;
use worktime_protocol::AckStatus;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub delivered: usize,
    pub duplicates: usize,
    pub flagged: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub fn run<D: Deliver>(log: &FallbackLog, delivery: &D) -> Result<ReplaySummary, String> {
    let mut events = log
        .replay_all()
        .map_err(|err| format!("Failed to open fallback log: {}", err))?;
    let mut summary = ReplaySummary::default();

    for event in events.by_ref() {
        match delivery.send(&event) {
            Ok(ack) => match ack.status {
                AckStatus::Accepted => summary.delivered += 1,
                AckStatus::Duplicate => summary.duplicates += 1,
                AckStatus::Flagged => summary.flagged += 1,
            },
            Err(err) => {
                tracing::warn!(event_id = %event.id, error = %err, "Replay delivery failed");
                summary.failed += 1;
            }
        }
    }

    summary.skipped = events.skipped();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon_client::tests::sample_event;
    use crate::daemon_client::DeliveryError;
    use chrono::Utc;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use tempfile::tempdir;
    use worktime_protocol::{ActivityAck, ActivityEvent};

    /// Remembers ids like the daemon does.
    #[derive(Default)]
    struct DedupingDaemon {
        seen: RefCell<HashSet<String>>,
        fail_ids: HashSet<String>,
    }

    impl Deliver for DedupingDaemon {
        fn send(&self, event: &ActivityEvent) -> Result<ActivityAck, DeliveryError> {
            if self.fail_ids.contains(&event.id) {
                return Err(DeliveryError::ServerError(500));
            }
            let status = if self.seen.borrow_mut().insert(event.id.clone()) {
                AckStatus::Accepted
            } else {
                AckStatus::Duplicate
            };
            Ok(ActivityAck {
                status,
                activity_id: event.id.clone(),
                timestamp: Utc::now(),
            })
        }
    }

    fn log_with(ids: &[&str]) -> (tempfile::TempDir, FallbackLog) {
        let temp = tempdir().expect("temp dir");
        let log = FallbackLog::new(temp.path().join("fallback.log"), "0.1.0");
        for id in ids {
            let mut event = sample_event();
            event.id = id.to_string();
            log.append(&event).expect("append");
        }
        (temp, log)
    }

    #[test]
    fn second_replay_only_sees_duplicates() {
        let (_temp, log) = log_with(&["evt-1", "evt-2", "evt-3"]);
        let daemon = DedupingDaemon::default();

        let first = run(&log, &daemon).expect("first replay");
        assert_eq!(first.delivered, 3);
        assert_eq!(first.duplicates, 0);

        let second = run(&log, &daemon).expect("second replay");
        assert_eq!(second.delivered, 0);
        assert_eq!(second.duplicates, 3);
    }

    #[test]
    fn failures_are_counted_and_do_not_stop_replay() {
        let (_temp, log) = log_with(&["evt-1", "evt-2", "evt-3"]);
        let daemon = DedupingDaemon {
            fail_ids: HashSet::from(["evt-2".to_string()]),
            ..DedupingDaemon::default()
        };

        let summary = run(&log, &daemon).expect("replay");
        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.failed, 1);
    }
}
