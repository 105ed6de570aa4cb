//! Converging warehouse records to the source of truth, one toolchain at a time.
//!
//! Each candidate id costs exactly one source lookup per pass. The lookup result
//! is then applied against a fresh warehouse read; a revision conflict re-reads
//! the warehouse and re-applies the same lookup result, so retries never touch
//! the API again.

use crate::error::AccessError;
use crate::sync::event_log::EventLog;
use crate::sync::migrate::repair_placeholder;
use crate::sync::model::{Event, ToolchainId, ToolchainRecord};
use crate::sync::provenance::{best_event, deletion_time, provenance_of};
use crate::sync::source::SourceOfTruth;
use crate::sync::store::Store;
use crate::sync::util::{iso_timestamp, truncate_with_ellipsis};
use crate::sync::warehouse::Warehouse;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub trusted_generator: String,
    pub placeholder_name: String,
    pub conflict_retries: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            trusted_generator: "otc-core".to_string(),
            placeholder_name: "deleted".to_string(),
            conflict_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Updated,
    Unchanged,
    Deleted,
    AlreadyDeleted,
    Unknown,
    Repaired,
}

impl Outcome {
    fn wrote(self) -> bool {
        !matches!(self, Outcome::Unchanged | Outcome::AlreadyDeleted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedId {
    pub toolchain_id: ToolchainId,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub candidates: usize,
    pub skipped_events: usize,
    pub api_calls: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub already_deleted: usize,
    pub unknown: usize,
    pub repaired: usize,
    pub failures: Vec<FailedId>,
    #[serde(skip)]
    pub written: BTreeSet<ToolchainId>,
}

impl ReconcileReport {
    fn record(&mut self, id: &ToolchainId, outcome: Outcome) {
        match outcome {
            Outcome::Inserted => self.inserted += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Deleted => self.deleted += 1,
            Outcome::AlreadyDeleted => self.already_deleted += 1,
            Outcome::Unknown => self.unknown += 1,
            Outcome::Repaired => self.repaired += 1,
        }
        if outcome.wrote() {
            self.written.insert(id.clone());
        }
    }

    fn fail(&mut self, id: &ToolchainId, err: &AccessError) {
        self.failures.push(FailedId {
            toolchain_id: id.clone(),
            kind: err.kind(),
            message: truncate_with_ellipsis(&err.to_string(), 240),
        });
    }

    pub fn writes(&self) -> usize {
        self.written.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "candidates={} api_calls={} inserted={} updated={} unchanged={} deleted={} unknown={} repaired={} written={} failed={}",
            self.candidates,
            self.api_calls,
            self.inserted,
            self.updated,
            self.unchanged,
            self.deleted,
            self.unknown,
            self.repaired,
            self.writes(),
            self.failed()
        )
    }
}

pub struct Reconciler<'a, W, E, S> {
    warehouse: &'a Warehouse<W>,
    events: &'a EventLog<E>,
    source: &'a S,
    settings: &'a ReconcileSettings,
    now: DateTime<Utc>,
}

impl<'a, W: Store, E: Store, S: SourceOfTruth> Reconciler<'a, W, E, S> {
    /// `now` stamps every record written during the pass.
    pub fn new(
        warehouse: &'a Warehouse<W>,
        events: &'a EventLog<E>,
        source: &'a S,
        settings: &'a ReconcileSettings,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            warehouse,
            events,
            source,
            settings,
            now,
        }
    }

    /// Incremental mode: one candidate per distinct toolchain, in first-seen
    /// order. The first event seen for an id is kept as its trigger.
    pub fn reconcile_events(&self, events: &[Event]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for event in events {
            match event.toolchain_id() {
                Some(id) => {
                    if seen.insert(id.clone()) {
                        candidates.push((id, event));
                    }
                }
                None => {
                    report.skipped_events += 1;
                    tracing::debug!(
                        doc_id = event.doc_id.as_deref().unwrap_or("?"),
                        "event names no toolchain; skipped"
                    );
                }
            }
        }
        report.candidates = candidates.len();
        for (id, event) in candidates {
            self.reconcile_one(&id, Some(event), &mut report);
        }
        report
    }

    /// Id mode, used at startup and for full refresh.
    pub fn reconcile_ids<I>(&self, ids: I) -> ReconcileReport
    where
        I: IntoIterator<Item = ToolchainId>,
    {
        let mut report = ReconcileReport::default();
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            report.candidates += 1;
            self.reconcile_one(&id, None, &mut report);
        }
        report
    }

    fn reconcile_one(
        &self,
        id: &ToolchainId,
        trigger: Option<&Event>,
        report: &mut ReconcileReport,
    ) {
        report.api_calls += 1;
        if report.api_calls % PROGRESS_EVERY == 0 {
            tracing::info!(api_calls = report.api_calls, "reconciliation progress");
        }
        let result = self
            .source
            .get_toolchain(id)
            .and_then(|fresh| self.apply_with_retries(id, fresh.as_ref(), trigger));
        match result {
            Ok(outcome) => {
                tracing::debug!(toolchain_id = %id, ?outcome, "reconciled");
                report.record(id, outcome);
            }
            Err(err) => {
                tracing::warn!(
                    toolchain_id = %id,
                    kind = err.kind(),
                    error = %err,
                    "reconciliation skipped toolchain"
                );
                report.fail(id, &err);
            }
        }
    }

    fn apply_with_retries(
        &self,
        id: &ToolchainId,
        fresh: Option<&ToolchainRecord>,
        trigger: Option<&Event>,
    ) -> Result<Outcome, AccessError> {
        let mut attempt = 0;
        loop {
            match self.apply(id, fresh, trigger) {
                Err(err) if err.is_conflict() && attempt < self.settings.conflict_retries => {
                    attempt += 1;
                    tracing::warn!(
                        toolchain_id = %id,
                        attempt,
                        "revision conflict; re-reading warehouse record"
                    );
                }
                other => return other,
            }
        }
    }

    fn apply(
        &self,
        id: &ToolchainId,
        fresh: Option<&ToolchainRecord>,
        trigger: Option<&Event>,
    ) -> Result<Outcome, AccessError> {
        let stored = self.warehouse.get(id)?;
        match (fresh, stored) {
            (Some(fresh), None) => {
                self.warehouse.insert(id, fresh)?;
                Ok(Outcome::Inserted)
            }
            (Some(fresh), Some(existing)) => {
                if fresh.same_content(&existing) {
                    return Ok(Outcome::Unchanged);
                }
                self.warehouse.replace(id, fresh, &existing)?;
                Ok(Outcome::Updated)
            }
            (None, Some(existing)) => self.retire(id, &existing),
            (None, None) => self.record_unknown(id, trigger),
        }
    }

    fn retire(
        &self,
        id: &ToolchainId,
        existing: &ToolchainRecord,
    ) -> Result<Outcome, AccessError> {
        if existing.is_placeholder(&self.settings.placeholder_name) {
            repair_placeholder(
                self.warehouse,
                self.events,
                &self.settings.trusted_generator,
                self.now,
                id,
                existing,
            )?;
            return Ok(Outcome::Repaired);
        }
        if existing.deleted {
            return Ok(Outcome::AlreadyDeleted);
        }
        let history = self.events.events_for(id)?;
        let date_deleted = deletion_time(&history).unwrap_or_else(|| iso_timestamp(self.now));
        let tombstone = ToolchainRecord {
            deleted: true,
            date_deleted: Some(date_deleted),
            ..existing.clone()
        };
        self.warehouse.replace(id, &tombstone, existing)?;
        Ok(Outcome::Deleted)
    }

    fn record_unknown(
        &self,
        id: &ToolchainId,
        trigger: Option<&Event>,
    ) -> Result<Outcome, AccessError> {
        let record = match trigger {
            Some(event) => {
                ToolchainRecord::tombstone(&provenance_of(event, id), iso_timestamp(self.now))
            }
            None => {
                let history = self.events.events_for(id)?;
                match best_event(&history, &self.settings.trusted_generator) {
                    Some(event) => {
                        let date =
                            deletion_time(&history).unwrap_or_else(|| iso_timestamp(self.now));
                        ToolchainRecord::tombstone(&provenance_of(event, id), date)
                    }
                    None => ToolchainRecord::orphan_tombstone(
                        id,
                        &self.settings.placeholder_name,
                        iso_timestamp(self.now),
                    ),
                }
            }
        };
        self.warehouse.insert(id, &record)?;
        Ok(Outcome::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::model::WEBHOOK_NOT_SET;
    use crate::sync::testing::{FakeSource, MemoryStore, event, event_store, warehouse_store};
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixture {
        warehouse: MemoryStore,
        events: MemoryStore,
        source: FakeSource,
        settings: ReconcileSettings,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                warehouse: warehouse_store(),
                events: event_store(),
                source: FakeSource::new(),
                settings: ReconcileSettings::default(),
            }
        }

        fn run_events(&self, events: &[Event]) -> ReconcileReport {
            let warehouse = Warehouse::new(&self.warehouse, 100);
            let log = EventLog::new(&self.events, 100, 100);
            Reconciler::new(&warehouse, &log, &self.source, &self.settings, now())
                .reconcile_events(events)
        }

        fn run_ids(&self, ids: &[&str]) -> ReconcileReport {
            let warehouse = Warehouse::new(&self.warehouse, 100);
            let log = EventLog::new(&self.events, 100, 100);
            Reconciler::new(&warehouse, &log, &self.source, &self.settings, now())
                .reconcile_ids(ids.iter().map(|id| ToolchainId::from(*id)))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .single()
            .expect("valid time")
    }

    fn parsed(value: serde_json::Value) -> Event {
        serde_json::from_value(value).expect("event")
    }

    fn source_record(id: &str, name: &str) -> serde_json::Value {
        json!({
            "toolchain_guid": id,
            "name": name,
            "organization_guid": "org-1",
            "services": [{"service_id": "github", "instance_id": format!("{id}-gh")}]
        })
    }

    #[test]
    fn new_toolchain_is_inserted_with_webhook_not_set() {
        let fx = Fixture::new();
        fx.source.put("tc-1", source_record("tc-1", "first"));
        let report = fx.run_events(&[parsed(event("create", "tc-1", "2024-06-01T11:59:00Z"))]);

        assert_eq!(report.inserted, 1);
        let stored = fx.warehouse.record("tc-1").expect("inserted");
        assert_eq!(stored.services[0].service_id, "github");
        assert_eq!(stored.services[0].webhook_id, WEBHOOK_NOT_SET);
        assert!(!stored.deleted);
    }

    #[test]
    fn vanished_toolchain_is_tombstoned_at_its_delete_event() {
        let fx = Fixture::new();
        fx.warehouse.seed("tc-2", source_record("tc-2", "second"));
        fx.events.seed("d", event("delete", "tc-2", "2024-01-01T00:00:00Z"));
        let report = fx.run_events(&[parsed(event("delete", "tc-2", "2024-01-01T00:00:00Z"))]);

        assert_eq!(report.deleted, 1);
        let stored = fx.warehouse.record("tc-2").expect("kept");
        assert!(stored.deleted);
        assert_eq!(stored.date_deleted.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(stored.name.as_deref(), Some("second"));
    }

    #[test]
    fn many_events_for_one_id_cost_one_api_call() {
        let fx = Fixture::new();
        fx.source.put("tc-3", source_record("tc-3", "busy"));
        let events: Vec<Event> = (0..50)
            .map(|n| {
                let published = format!("2024-06-01T11:{:02}:00Z", n % 60);
                parsed(event("update", "tc-3", &published))
            })
            .collect();
        let report = fx.run_events(&events);

        assert_eq!(fx.source.calls_for("tc-3"), 1);
        assert_eq!(report.candidates, 1);
        assert_eq!(report.api_calls, 1);
    }

    #[test]
    fn second_pass_over_same_inputs_writes_nothing() {
        let fx = Fixture::new();
        fx.source.put("tc-1", source_record("tc-1", "one"));
        fx.warehouse.seed("tc-2", source_record("tc-2", "two"));
        let events = vec![
            parsed(event("create", "tc-1", "2024-06-01T11:00:00Z")),
            parsed(event("delete", "tc-2", "2024-06-01T11:01:00Z")),
            parsed(event("delete", "tc-4", "2024-06-01T11:02:00Z")),
        ];
        let first = fx.run_events(&events);
        assert_eq!(first.writes(), 3);
        let writes_after_first = fx.warehouse.writes();

        let second = fx.run_events(&events);
        assert_eq!(second.writes(), 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.already_deleted, 2);
        assert_eq!(fx.warehouse.writes(), writes_after_first);
    }

    #[test]
    fn event_with_oddly_typed_fields_is_still_reconciled() {
        let fx = Fixture::new();
        let mut odd = event("create", "tc-1", "2024-06-01T11:59:00Z");
        odd["actor"] = json!("user-1");
        fx.events.seed("e1", odd);
        fx.source.put("tc-1", source_record("tc-1", "first"));

        let log = EventLog::new(&fx.events, 100, 100);
        let events = log.events_since(None).expect("scan");
        assert_eq!(events.len(), 1);
        let report = fx.run_events(&events);

        assert_eq!(report.api_calls, 1);
        assert_eq!(report.inserted, 1);
        assert!(fx.warehouse.record("tc-1").is_some());
    }

    #[test]
    fn source_record_with_null_services_converges() {
        let fx = Fixture::new();
        fx.source.put(
            "tc-1",
            json!({"toolchain_guid": "tc-1", "name": "bare", "services": null, "created": 7}),
        );

        let first = fx.run_ids(&["tc-1"]);
        assert!(first.failures.is_empty());
        assert_eq!(first.inserted, 1);
        assert!(first.summary().contains("written=1 failed=0"));
        let stored = fx.warehouse.record("tc-1").expect("inserted");
        assert!(stored.services.is_empty());
        assert_eq!(stored.created, None);

        let second = fx.run_ids(&["tc-1"]);
        assert!(second.failures.is_empty());
        assert_eq!(second.unchanged, 1);
        assert!(second.summary().contains("written=0"));
    }

    #[test]
    fn changed_source_record_updates_in_place() {
        let fx = Fixture::new();
        fx.warehouse.seed("tc-1", source_record("tc-1", "old"));
        fx.source.put("tc-1", source_record("tc-1", "new"));
        let report = fx.run_ids(&["tc-1"]);
        assert_eq!(report.updated, 1);
        assert_eq!(
            fx.warehouse.record("tc-1").and_then(|r| r.name),
            Some("new".to_string())
        );
    }

    #[test]
    fn unknown_id_from_event_takes_event_metadata() {
        let fx = Fixture::new();
        let report = fx.run_events(&[parsed(event("create", "tc-5", "2024-05-01T00:00:00Z"))]);
        assert_eq!(report.unknown, 1);
        let stored = fx.warehouse.record("tc-5").expect("tombstone");
        assert!(stored.deleted);
        assert_eq!(stored.name.as_deref(), Some("unknown"));
        assert_eq!(stored.organization_guid.as_deref(), Some("org-1"));
        assert_eq!(stored.creator.as_deref(), Some("user-1"));
        assert_eq!(stored.created.as_deref(), Some("2024-05-01T00:00:00Z"));
        assert_eq!(stored.date_deleted.as_deref(), Some("2024-06-01T12:00:00.000Z"));
    }

    #[test]
    fn unknown_id_without_events_is_flagged() {
        let fx = Fixture::new();
        let report = fx.run_ids(&["tc-6"]);
        assert_eq!(report.unknown, 1);
        let stored = fx.warehouse.record("tc-6").expect("tombstone");
        assert!(stored.no_event_found);
        assert!(stored.deleted);
        assert!(!stored.is_placeholder("deleted"));
    }

    #[test]
    fn unknown_id_in_id_mode_uses_best_logged_event() {
        let fx = Fixture::new();
        fx.events.seed("c", event("create", "tc-7", "2023-01-01T00:00:00Z"));
        fx.events.seed("d", event("delete", "tc-7", "2023-02-01T00:00:00Z"));
        fx.run_ids(&["tc-7"]);
        let stored = fx.warehouse.record("tc-7").expect("tombstone");
        assert_eq!(stored.created.as_deref(), Some("2023-01-01T00:00:00Z"));
        assert_eq!(stored.date_deleted.as_deref(), Some("2023-02-01T00:00:00Z"));
        assert!(!stored.no_event_found);
    }

    #[test]
    fn conflicts_are_retried_without_calling_the_api_again() {
        let fx = Fixture::new();
        fx.warehouse.seed("tc-1", source_record("tc-1", "old"));
        fx.source.put("tc-1", source_record("tc-1", "new"));
        fx.warehouse.inject_conflicts("tc-1", 2);
        let report = fx.run_ids(&["tc-1"]);
        assert_eq!(report.updated, 1);
        assert_eq!(fx.source.calls_for("tc-1"), 1);
    }

    #[test]
    fn exhausted_conflict_retries_fail_only_that_id() {
        let fx = Fixture::new();
        fx.warehouse.seed("tc-1", source_record("tc-1", "old"));
        fx.source.put("tc-1", source_record("tc-1", "new"));
        fx.source.put("tc-2", source_record("tc-2", "fine"));
        fx.warehouse.inject_conflicts("tc-1", 10);
        let report = fx.run_ids(&["tc-1", "tc-2"]);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.failures[0].kind, "conflict");
        assert_eq!(report.inserted, 1);
        assert_eq!(fx.source.calls_for("tc-1"), 1);
    }

    #[test]
    fn source_failure_is_skipped_and_counted() {
        let fx = Fixture::new();
        fx.source.fail("tc-1");
        fx.source.put("tc-2", source_record("tc-2", "fine"));
        let report = fx.run_ids(&["tc-1", "tc-2", "tc-1"]);
        assert_eq!(report.candidates, 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.failures[0].kind, "transient");
        assert!(fx.warehouse.record("tc-1").is_none());
        assert!(fx.warehouse.record("tc-2").is_some());
    }

    #[test]
    fn placeholder_on_delete_path_is_repaired() {
        let fx = Fixture::new();
        fx.warehouse.seed(
            "tc-8",
            json!({"toolchain_guid": "tc-8", "name": "deleted", "deleted": true}),
        );
        fx.events.seed("c", event("create", "tc-8", "2023-03-03T00:00:00Z"));
        let report = fx.run_ids(&["tc-8"]);
        assert_eq!(report.repaired, 1);
        let stored = fx.warehouse.record("tc-8").expect("record");
        assert_eq!(stored.name.as_deref(), Some("unknown"));
        assert_eq!(stored.created.as_deref(), Some("2023-03-03T00:00:00Z"));
    }

    #[test]
    fn events_without_toolchain_are_skipped() {
        let fx = Fixture::new();
        let report = fx.run_events(&[parsed(json!({"verb": "create", "generator": "otc-core"}))]);
        assert_eq!(report.skipped_events, 1);
        assert_eq!(report.candidates, 0);
        assert_eq!(fx.source.total_calls(), 0);
    }

    #[test]
    fn full_refresh_converges_presence_to_source() {
        let fx = Fixture::new();
        for id in ["tc-1", "tc-2", "tc-3"] {
            fx.warehouse.seed(id, source_record(id, "stale"));
        }
        fx.source.put("tc-1", source_record("tc-1", "live"));
        fx.source.put("tc-3", source_record("tc-3", "live"));

        let warehouse = Warehouse::new(&fx.warehouse, 2);
        let retained = warehouse.retained_ids().expect("retained");
        fx.run_ids(&retained.iter().map(ToolchainId::as_str).collect::<Vec<_>>());

        let after = warehouse.retained_ids().expect("retained");
        let after: Vec<_> = after.iter().map(ToolchainId::as_str).collect();
        assert_eq!(after, vec!["tc-1", "tc-3"]);
        assert!(fx.warehouse.record("tc-2").expect("kept").deleted);
    }
}
