pub mod sync_export;
pub mod sync_migrate;
pub mod sync_refresh;
pub mod sync_run;
pub mod sync_startup;
pub mod sync_status;
pub mod sync_tick;

use anyhow::Result;
use serde::Serialize;

use crate::couch::CouchStore;
use crate::otc::OtcSource;
use crate::sync::config::SyncConfig;
use crate::sync::event_log::EventLog;
use crate::sync::reconcile::ReconcileReport;
use crate::sync::scheduler::{SyncContext, SyncSettings};
use crate::sync::warehouse::Warehouse;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

pub type LiveContext = SyncContext<CouchStore, CouchStore, OtcSource<CouchStore>>;

/// Opens the warehouse, the event log and the toolchain API described by `cfg`.
/// Nothing is contacted until the first call.
pub fn connect(cfg: &SyncConfig) -> Result<LiveContext> {
    let couch = &cfg.couch;
    let warehouse = CouchStore::connect(&couch.url, &couch.warehouse_db, couch.timeout_secs)?;
    let events = CouchStore::connect(&couch.url, &couch.events_db, couch.timeout_secs)?;
    let index = CouchStore::connect(&couch.url, &couch.toolchains_db, couch.timeout_secs)?;
    let source = OtcSource::new(
        &cfg.otc.base_url,
        cfg.otc.token.clone(),
        cfg.otc.timeout_secs,
        index,
        cfg.scan.index_batch,
    )?;
    Ok(SyncContext {
        warehouse: Warehouse::new(warehouse, cfg.scan.id_batch),
        events: EventLog::new(events, cfg.scan.event_batch, cfg.scan.id_batch),
        source,
        settings: SyncSettings::from_config(cfg),
    })
}

/// Adds the counters of `pass` as details and every failed id as an issue.
pub fn add_reconcile_report(
    report: &mut CommandReport,
    label: &str,
    pass: &ReconcileReport,
) {
    report.detail(format!("{label}.candidates={}", pass.candidates));
    report.detail(format!("{label}.api_calls={}", pass.api_calls));
    report.detail(format!("{label}.inserted={}", pass.inserted));
    report.detail(format!("{label}.updated={}", pass.updated));
    report.detail(format!("{label}.unchanged={}", pass.unchanged));
    report.detail(format!("{label}.deleted={}", pass.deleted));
    report.detail(format!("{label}.already_deleted={}", pass.already_deleted));
    report.detail(format!("{label}.unknown={}", pass.unknown));
    report.detail(format!("{label}.repaired={}", pass.repaired));
    if pass.skipped_events > 0 {
        report.detail(format!("{label}.skipped_events={}", pass.skipped_events));
    }
    for failure in &pass.failures {
        report.issue(format!(
            "{label}: toolchain {} failed ({}): {}",
            failure.toolchain_id, failure.kind, failure.message
        ));
    }
}
