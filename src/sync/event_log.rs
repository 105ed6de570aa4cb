use crate::error::AccessError;
use crate::sync::checkpoint::Checkpoint;
use crate::sync::model::{Event, ToolchainId};
use crate::sync::scanner::{RowField, ViewQuery, collect_ids, scan};
use crate::sync::store::{Store, ViewRow};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Instant;

/// Events keyed by owning toolchain id; reduces to a count per id.
pub const EVENTS_BY_TOOLCHAIN_VIEW: &str = "allToolChainId/allToolChainIds";
/// Events keyed by `[published minute]`.
pub const EVENTS_BY_MINUTE_VIEW: &str = "provisioning/toolchain_id_by_minute";
/// Pipeline job executions keyed by toolchain id.
pub const JOB_EXECS_BY_TOOLCHAIN_VIEW: &str = "pipeline-v2/ejd_job_execs_by_toolchain";

/// Read-only access to the metrics event log.
pub struct EventLog<S> {
    store: S,
    event_batch: usize,
    id_batch: usize,
}

impl<S: Store> EventLog<S> {
    pub fn new(store: S, event_batch: usize, id_batch: usize) -> Self {
        Self {
            store,
            event_batch,
            id_batch,
        }
    }

    /// Events published in or after the checkpoint's minute, in view order.
    /// Without a checkpoint the whole log is returned.
    pub fn events_since(&self, since: Option<&Checkpoint>) -> Result<Vec<Event>, AccessError> {
        let started = Instant::now();
        let mut query = ViewQuery::new(EVENTS_BY_MINUTE_VIEW, self.event_batch).with_docs();
        if let Some(checkpoint) = since {
            query = query.start_key(checkpoint.start_key());
        }
        let events = self.decode_rows(query)?;
        tracing::info!(
            since = since.map(Checkpoint::as_str).unwrap_or("beginning"),
            events = events.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scanned event log"
        );
        Ok(events)
    }

    /// Full event history of one toolchain.
    pub fn events_for(&self, id: &ToolchainId) -> Result<Vec<Event>, AccessError> {
        let query = ViewQuery::new(EVENTS_BY_TOOLCHAIN_VIEW, self.event_batch)
            .with_docs()
            .key(json!(id.as_str()));
        self.decode_rows(query)
    }

    /// Every toolchain id that appears in the log.
    pub fn all_ids(&self) -> Result<BTreeSet<ToolchainId>, AccessError> {
        let started = Instant::now();
        let query = ViewQuery::new(EVENTS_BY_TOOLCHAIN_VIEW, self.id_batch).grouped();
        let ids = collect_ids(&self.store, query, RowField::Key)?;
        tracing::info!(
            ids = ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "collected toolchain ids from event log"
        );
        Ok(ids)
    }

    /// Toolchains with at least one recorded pipeline job execution.
    pub fn active_toolchains(&self) -> Result<BTreeSet<ToolchainId>, AccessError> {
        let query = ViewQuery::new(JOB_EXECS_BY_TOOLCHAIN_VIEW, self.id_batch);
        collect_ids(&self.store, query, RowField::Key)
    }

    fn decode_rows(&self, query: ViewQuery) -> Result<Vec<Event>, AccessError> {
        let view = query.view.clone();
        let mut events = Vec::new();
        let mut rows = scan(&self.store, query)?;
        for row in rows.by_ref() {
            if let Some(event) = decode_event(&view, row?) {
                events.push(event);
            }
        }
        tracing::debug!(
            view,
            pages = rows.pages_fetched(),
            events = events.len(),
            "decoded event rows"
        );
        Ok(events)
    }
}

/// Only a row whose document is not an object is dropped here; events that
/// name no toolchain are counted as skipped by the reconciler.
fn decode_event(view: &str, row: ViewRow) -> Option<Event> {
    let doc = row.doc?;
    match serde_json::from_value::<Event>(doc) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::warn!(
                view,
                doc_id = row.id.as_deref().unwrap_or("?"),
                error = %err,
                "skipping unreadable event"
            );
            None
        }
    }
}
