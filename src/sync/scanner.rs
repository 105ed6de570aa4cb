//! Batched view scanning with key-based cursors.
//!
//! Every request asks for one row more than it will emit. The extra row proves
//! another page exists and becomes the start of that page, so no offset is ever
//! sent to the store. Reduced rows have no document id and are cursored on the
//! key alone; map rows use `(key, doc id)` to split runs of equal keys.
//!
//! Rows emitted for documents written between two page requests may be missed
//! or seen twice. The store offers no snapshot, and every consumer here is
//! idempotent, so this is accepted.

use crate::error::AccessError;
use crate::sync::model::ToolchainId;
use crate::sync::store::{PageRequest, Store, ViewRow};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub struct ViewQuery {
    pub view: String,
    pub batch_size: usize,
    pub reduce: bool,
    pub group: bool,
    pub include_docs: bool,
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub limit: Option<usize>,
}

impl ViewQuery {
    pub fn new(view: impl Into<String>, batch_size: usize) -> Self {
        Self {
            view: view.into(),
            batch_size,
            reduce: false,
            group: false,
            include_docs: false,
            start_key: None,
            end_key: None,
            limit: None,
        }
    }

    /// Grouped reduce: one row per distinct key.
    pub fn grouped(mut self) -> Self {
        self.reduce = true;
        self.group = true;
        self
    }

    pub fn with_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }

    /// Restricts the scan to rows whose key equals `key`.
    pub fn key(mut self, key: Value) -> Self {
        self.start_key = Some(key.clone());
        self.end_key = Some(key);
        self
    }

    pub fn start_key(mut self, key: Value) -> Self {
        self.start_key = Some(key);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone)]
struct Cursor {
    key: Value,
    doc_id: Option<String>,
}

/// Lazy row sequence over a view. Yields an error at most once, then stops.
pub struct ViewScan<'s, S: Store + ?Sized> {
    store: &'s S,
    query: ViewQuery,
    cursor: Option<Cursor>,
    remaining: Option<usize>,
    pending: VecDeque<ViewRow>,
    exhausted: bool,
    pages: usize,
}

pub fn scan<S: Store + ?Sized>(
    store: &S,
    query: ViewQuery,
) -> Result<ViewScan<'_, S>, AccessError> {
    if query.batch_size == 0 {
        return Err(AccessError::InvalidQuery(format!(
            "batch size for {} must be 1 or more",
            query.view
        )));
    }
    if query.limit == Some(0) {
        return Err(AccessError::InvalidQuery(format!(
            "limit for {} must be 1 or more",
            query.view
        )));
    }
    Ok(ViewScan {
        store,
        remaining: query.limit,
        query,
        cursor: None,
        pending: VecDeque::new(),
        exhausted: false,
        pages: 0,
    })
}

/// Which part of a row carries the toolchain id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowField {
    Key,
    Value,
}

/// Scans a view and collects the distinct toolchain ids it names. Rows whose
/// chosen field is not a non-blank string are skipped.
pub fn collect_ids<S: Store + ?Sized>(
    store: &S,
    query: ViewQuery,
    field: RowField,
) -> Result<BTreeSet<ToolchainId>, AccessError> {
    let mut ids = BTreeSet::new();
    for row in scan(store, query)? {
        let row = row?;
        let raw = match field {
            RowField::Key => &row.key,
            RowField::Value => &row.value,
        };
        if let Some(id) = raw.as_str().and_then(ToolchainId::parse) {
            ids.insert(id);
        }
    }
    Ok(ids)
}

impl<S: Store + ?Sized> ViewScan<'_, S> {
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    fn page_request(&self, page_size: usize) -> PageRequest {
        let (start_key, start_key_doc_id) = match &self.cursor {
            Some(cursor) => (Some(cursor.key.clone()), cursor.doc_id.clone()),
            None => (self.query.start_key.clone(), None),
        };
        PageRequest {
            view: self.query.view.clone(),
            reduce: self.query.reduce,
            group: self.query.group,
            include_docs: self.query.include_docs,
            start_key,
            start_key_doc_id,
            end_key: self.query.end_key.clone(),
            limit: page_size + 1,
        }
    }

    fn fetch_page(&mut self) -> Result<(), AccessError> {
        let page_size = match self.remaining {
            Some(remaining) => remaining.min(self.query.batch_size),
            None => self.query.batch_size,
        };
        let request = self.page_request(page_size);
        let mut rows = self.store.query_view(&request)?;
        self.pages += 1;

        if rows.len() > page_size {
            let lookahead = rows.swap_remove(page_size);
            rows.truncate(page_size);
            self.cursor = Some(Cursor {
                key: lookahead.key,
                doc_id: if self.query.reduce { None } else { lookahead.id },
            });
        } else {
            self.exhausted = true;
        }

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(rows.len());
            if *remaining == 0 {
                self.exhausted = true;
            }
        }
        self.pending.extend(rows);
        Ok(())
    }
}

impl<S: Store + ?Sized> Iterator for ViewScan<'_, S> {
    type Item = Result<ViewRow, AccessError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Some(Ok(row));
            }
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
    }
}
