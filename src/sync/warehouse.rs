use crate::error::AccessError;
use crate::sync::model::{ToolchainId, ToolchainRecord};
use crate::sync::scanner::{RowField, ViewQuery, collect_ids, scan};
use crate::sync::store::{Store, ViewRow};
use std::collections::BTreeSet;
use std::time::Instant;

/// Every warehouse document, keyed by toolchain id.
pub const TOOLCHAINS_BY_ID_VIEW: &str = "toolchains/toolchains_by_id";
/// Non-deleted toolchains, keyed by id.
pub const RETAINED_VIEW: &str = "toolchains/retainedToolChains";
/// Placeholder tombstones still awaiting provenance.
pub const PLACEHOLDER_VIEW: &str = "toolchains/oldDeleteDocs";
/// Non-deleted toolchains with their documents, for reporting.
pub const LIVE_DOCS_VIEW: &str = "toolchains/ejd_retained_toolchains";

/// The analytics-side copy of every toolchain.
pub struct Warehouse<S> {
    store: S,
    id_batch: usize,
}

impl<S: Store> Warehouse<S> {
    pub fn new(store: S, id_batch: usize) -> Self {
        Self { store, id_batch }
    }

    /// The stored record, carrying its revision for a later optimistic write.
    pub fn get(&self, id: &ToolchainId) -> Result<Option<ToolchainRecord>, AccessError> {
        let Some(doc) = self.store.get_document(id.as_str())? else {
            return Ok(None);
        };
        let mut record = ToolchainRecord::from_document(doc.body)?;
        record.rev = doc.rev.or(record.rev);
        Ok(Some(record))
    }

    /// Creates the record; fails with a conflict if another writer got there first.
    pub fn insert(
        &self,
        id: &ToolchainId,
        record: &ToolchainRecord,
    ) -> Result<String, AccessError> {
        self.write(id, record, None)
    }

    /// Overwrites `existing`; fails with a conflict if it has changed since it was read.
    pub fn replace(
        &self,
        id: &ToolchainId,
        record: &ToolchainRecord,
        existing: &ToolchainRecord,
    ) -> Result<String, AccessError> {
        self.write(id, record, existing.rev.as_deref())
    }

    fn write(
        &self,
        id: &ToolchainId,
        record: &ToolchainRecord,
        expected_rev: Option<&str>,
    ) -> Result<String, AccessError> {
        let body = ToolchainRecord {
            doc_id: None,
            rev: None,
            ..record.clone()
        }
        .to_document()?;
        self.store.put_document(id.as_str(), &body, expected_rev)
    }

    pub fn all_ids(&self) -> Result<BTreeSet<ToolchainId>, AccessError> {
        self.timed_ids(
            TOOLCHAINS_BY_ID_VIEW,
            "collected toolchain ids from warehouse",
        )
    }

    pub fn retained_ids(&self) -> Result<BTreeSet<ToolchainId>, AccessError> {
        self.timed_ids(RETAINED_VIEW, "collected retained toolchain ids")
    }

    /// Up to `limit` placeholder tombstones. Documents that fail to parse or
    /// no longer look like placeholders are left out.
    pub fn placeholders(
        &self,
        limit: usize,
        placeholder_name: &str,
    ) -> Result<Vec<ToolchainRecord>, AccessError> {
        let query = ViewQuery::new(PLACEHOLDER_VIEW, limit)
            .with_docs()
            .limit(limit);
        let records = self.decode_rows(query)?;
        Ok(records
            .into_iter()
            .filter(|record| record.is_placeholder(placeholder_name))
            .collect())
    }

    /// Every non-deleted record, for reporting.
    pub fn live_records(&self) -> Result<Vec<ToolchainRecord>, AccessError> {
        let query = ViewQuery::new(LIVE_DOCS_VIEW, self.id_batch).with_docs();
        let records = self.decode_rows(query)?;
        Ok(records
            .into_iter()
            .filter(|record| !record.deleted)
            .collect())
    }

    fn timed_ids(&self, view: &str, message: &str) -> Result<BTreeSet<ToolchainId>, AccessError> {
        let started = Instant::now();
        let query = ViewQuery::new(view, self.id_batch).grouped();
        let ids = collect_ids(&self.store, query, RowField::Key)?;
        tracing::info!(
            view,
            ids = ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "{message}"
        );
        Ok(ids)
    }

    fn decode_rows(&self, query: ViewQuery) -> Result<Vec<ToolchainRecord>, AccessError> {
        let view = query.view.clone();
        let mut records = Vec::new();
        for row in scan(&self.store, query)? {
            if let Some(record) = decode_record(&view, row?) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn decode_record(view: &str, row: ViewRow) -> Option<ToolchainRecord> {
    let doc = row.doc?;
    match ToolchainRecord::from_document(doc) {
        Ok(record) => Some(record),
        Err(err) => {
            tracing::warn!(
                view,
                doc_id = row.id.as_deref().unwrap_or("?"),
                error = %err,
                "skipping unreadable warehouse record"
            );
            None
        }
    }
}
