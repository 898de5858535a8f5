//! Startup rebuild of derived state.
//!
//! Derived tables are dropped and recomputed from the `events` table, merged
//! with events flagged as out of order while live and with any fallback-logged
//! events the daemon never stored. The batch is sorted per user before
//! application, so late events land where they belong. Flagged events then
//! move from `reconciliation` into `events`.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use worktime_core::FallbackLog;
use worktime_protocol::ActivityEvent;

use crate::aggregator::SessionAggregator;
use crate::db::Db;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub stored: usize,
    pub imported: usize,
    /// Previously flagged events folded back in.
    pub reconciled: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub out_of_order: usize,
    /// Malformed fallback lines.
    pub skipped: usize,
}

pub fn rebuild_from_events(
    db: &Db,
    aggregator: &SessionAggregator,
    fallback: Option<&FallbackLog>,
    now: DateTime<Utc>,
) -> Result<ReplayReport, String> {
    let stored = db.list_events()?;
    let mut known: HashSet<String> = stored.iter().map(|event| event.id.clone()).collect();

    let flagged = db.list_reconciliation()?;
    let late: Vec<ActivityEvent> = flagged
        .iter()
        .filter(|event| known.insert(event.id.clone()))
        .cloned()
        .collect();

    let (imported, skipped) = match fallback {
        Some(log) => import_fallback(log, &mut known),
        None => (Vec::new(), 0),
    };

    let mut report = ReplayReport {
        stored: stored.len(),
        imported: imported.len(),
        skipped,
        ..ReplayReport::default()
    };

    db.clear_materialized()?;

    let mut batch = stored;
    batch.extend(late);
    batch.extend(imported.iter().cloned());
    let summary = aggregator.apply_batch(batch);
    report.applied = summary.applied;
    report.duplicates = summary.duplicates;
    report.out_of_order = summary.out_of_order;

    if !imported.is_empty() {
        db.insert_events(&imported)?;
    }
    report.reconciled = db.resolve_reconciliation(&flagged)?;
    db.persist(&summary.changes)?;
    db.persist(&aggregator.sweep(now))?;

    Ok(report)
}

/// Fallback events not yet known, first occurrence of each id.
fn import_fallback(
    log: &FallbackLog,
    known: &mut HashSet<String>,
) -> (Vec<ActivityEvent>, usize) {
    let mut events = match log.replay_all() {
        Ok(events) => events,
        Err(err) => {
            tracing::warn!(path = %log.path().display(), error = %err, "Failed to open fallback log");
            return (Vec::new(), 0);
        }
    };

    let mut imported = Vec::new();
    for event in events.by_ref() {
        if known.insert(event.id.clone()) {
            imported.push(event);
        }
    }
    (imported, events.skipped())
}
