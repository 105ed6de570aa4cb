//! Repair of legacy placeholder tombstones.
//!
//! Older deployments wrote a bare `name = "deleted"` document when the API
//! forgot a toolchain. The migrator replaces each with a tombstone built from
//! the event log, or flags it `no_event_found` when the log has nothing, so
//! that every pass shrinks the placeholder view.

use crate::error::AccessError;
use crate::sync::event_log::EventLog;
use crate::sync::model::{ToolchainId, ToolchainRecord};
use crate::sync::provenance::{best_event, deletion_time, provenance_of};
use crate::sync::store::Store;
use crate::sync::util::iso_timestamp;
use crate::sync::warehouse::Warehouse;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// Rewritten with provenance from the event log.
    Restored,
    /// No trusted event exists; flagged so it leaves the placeholder view.
    Flagged,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub passes: usize,
    pub found: usize,
    pub restored: usize,
    pub flagged: usize,
    pub failed: usize,
    pub stalled: bool,
}

impl MigrationReport {
    pub fn summary(&self) -> String {
        format!(
            "passes={} found={} restored={} flagged={} failed={}{}",
            self.passes,
            self.found,
            self.restored,
            self.flagged,
            self.failed,
            if self.stalled { " (stalled)" } else { "" }
        )
    }
}

/// Rewrites one placeholder. Shared with the reconciler, which meets
/// placeholders on its delete path.
pub fn repair_placeholder<W: Store, E: Store>(
    warehouse: &Warehouse<W>,
    events: &EventLog<E>,
    trusted_generator: &str,
    now: DateTime<Utc>,
    id: &ToolchainId,
    existing: &ToolchainRecord,
) -> Result<Repair, AccessError> {
    let history = events.events_for(id)?;
    match best_event(&history, trusted_generator) {
        Some(event) => {
            let date_deleted = existing
                .date_deleted
                .clone()
                .or_else(|| deletion_time(&history))
                .unwrap_or_else(|| iso_timestamp(now));
            let tombstone = ToolchainRecord::tombstone(&provenance_of(event, id), date_deleted);
            warehouse.replace(id, &tombstone, existing)?;
            Ok(Repair::Restored)
        }
        None => {
            let flagged = ToolchainRecord {
                no_event_found: true,
                ..existing.clone()
            };
            warehouse.replace(id, &flagged, existing)?;
            Ok(Repair::Flagged)
        }
    }
}

pub struct Migrator<'a, W, E> {
    warehouse: &'a Warehouse<W>,
    events: &'a EventLog<E>,
    trusted_generator: &'a str,
    placeholder_name: &'a str,
    batch: usize,
}

impl<'a, W: Store, E: Store> Migrator<'a, W, E> {
    pub fn new(
        warehouse: &'a Warehouse<W>,
        events: &'a EventLog<E>,
        trusted_generator: &'a str,
        placeholder_name: &'a str,
        batch: usize,
    ) -> Self {
        Self {
            warehouse,
            events,
            trusted_generator,
            placeholder_name,
            batch,
        }
    }

    /// Runs passes until the placeholder view is empty, or until a pass
    /// repairs nothing. A failing view query ends the run with an error.
    pub fn run(&self, now: DateTime<Utc>) -> Result<MigrationReport, AccessError> {
        let mut report = MigrationReport::default();
        loop {
            let batch = self.warehouse.placeholders(self.batch, self.placeholder_name)?;
            if batch.is_empty() {
                break;
            }
            report.passes += 1;
            report.found += batch.len();

            let mut progressed = 0;
            for existing in &batch {
                let Some(id) = ToolchainId::parse(&existing.toolchain_guid)
                    .or_else(|| existing.doc_id.as_deref().and_then(ToolchainId::parse))
                else {
                    report.failed += 1;
                    continue;
                };
                match repair_placeholder(
                    self.warehouse,
                    self.events,
                    self.trusted_generator,
                    now,
                    &id,
                    existing,
                ) {
                    Ok(Repair::Restored) => {
                        report.restored += 1;
                        progressed += 1;
                    }
                    Ok(Repair::Flagged) => {
                        report.flagged += 1;
                        progressed += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            toolchain_id = %id,
                            kind = err.kind(),
                            error = %err,
                            "placeholder repair failed"
                        );
                        report.failed += 1;
                    }
                }
            }
            tracing::info!(
                pass = report.passes,
                found = batch.len(),
                repaired = progressed,
                "migration pass finished"
            );
            if progressed == 0 {
                tracing::warn!(
                    remaining = batch.len(),
                    "migration pass repaired nothing; stopping"
                );
                report.stalled = true;
                break;
            }
        }
        Ok(report)
    }
}
