//! In-memory collaborators for unit tests.

use crate::error::AccessError;
use crate::sync::event_log::{
    EVENTS_BY_MINUTE_VIEW, EVENTS_BY_TOOLCHAIN_VIEW, JOB_EXECS_BY_TOOLCHAIN_VIEW,
};
use crate::sync::model::{Event, ToolchainId, ToolchainRecord, flag_value};
use crate::sync::source::{SOURCE_INDEX_VIEW, SourceOfTruth};
use crate::sync::store::{Document, PageRequest, Store, ViewRow};
use crate::sync::warehouse::{
    LIVE_DOCS_VIEW, PLACEHOLDER_VIEW, RETAINED_VIEW, TOOLCHAINS_BY_ID_VIEW,
};
use serde_json::{Value, json};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

type MapFn = Box<dyn Fn(&str, &Value) -> Vec<(Value, Value)> + Send + Sync>;

/// CouchDB-like store: map functions over documents, grouped count reduce,
/// inclusive key ranges, revision checks on write.
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, (u64, Value)>>,
    views: BTreeMap<String, MapFn>,
    requests: Mutex<Vec<PageRequest>>,
    writes: AtomicUsize,
    failing_views: AtomicBool,
    failing_puts: Mutex<BTreeSet<String>>,
    injected_conflicts: Mutex<BTreeMap<String, usize>>,
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

pub fn collate(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = collate(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn with_meta(id: &str, seq: u64, body: &Value) -> Value {
    let mut doc = body.clone();
    if let Some(map) = doc.as_object_mut() {
        map.insert("_id".to_string(), json!(id));
        map.insert("_rev".to_string(), json!(format!("{seq}-mem")));
    }
    doc
}

fn strip_meta(body: &Value) -> Value {
    let mut doc = body.clone();
    if let Some(map) = doc.as_object_mut() {
        map.remove("_id");
        map.remove("_rev");
    }
    doc
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            views: BTreeMap::new(),
            requests: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            failing_views: AtomicBool::new(false),
            failing_puts: Mutex::new(BTreeSet::new()),
            injected_conflicts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_view<F>(mut self, name: &str, map: F) -> Self
    where
        F: Fn(&str, &Value) -> Vec<(Value, Value)> + Send + Sync + 'static,
    {
        self.views.insert(name.to_string(), Box::new(map));
        self
    }

    /// Stores a document without counting it as a write.
    pub fn seed(&self, id: &str, body: Value) {
        let mut docs = self.docs.lock().expect("docs lock");
        let seq = docs.get(id).map_or(1, |(seq, _)| seq + 1);
        docs.insert(id.to_string(), (seq, strip_meta(&body)));
    }

    pub fn doc(&self, id: &str) -> Option<Value> {
        let docs = self.docs.lock().expect("docs lock");
        docs.get(id).map(|(seq, body)| with_meta(id, *seq, body))
    }

    pub fn record(&self, id: &str) -> Option<ToolchainRecord> {
        self.doc(id)
            .map(|doc| ToolchainRecord::from_document(doc).expect("stored record parses"))
    }

    pub fn len(&self) -> usize {
        self.docs.lock().expect("docs lock").len()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(AtomicOrdering::SeqCst)
    }

    pub fn page_requests(&self) -> Vec<PageRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn fail_views(&self, fail: bool) {
        self.failing_views.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn fail_puts_for(&self, id: &str) {
        self.failing_puts
            .lock()
            .expect("puts lock")
            .insert(id.to_string());
    }

    /// The next `times` writes to `id` lose a race against another writer: the
    /// stored revision moves on and the write is rejected.
    pub fn inject_conflicts(&self, id: &str, times: usize) {
        self.injected_conflicts
            .lock()
            .expect("conflicts lock")
            .insert(id.to_string(), times);
    }

    fn rows_for(&self, page: &PageRequest) -> Result<Vec<ViewRow>, AccessError> {
        let docs = self.docs.lock().expect("docs lock");
        let mut rows: Vec<ViewRow> = if page.view == "_all_docs" {
            docs.iter()
                .map(|(id, (seq, body))| ViewRow {
                    id: Some(id.clone()),
                    key: json!(id),
                    value: json!({"rev": format!("{seq}-mem")}),
                    doc: Some(with_meta(id, *seq, body)),
                })
                .collect()
        } else {
            let map = self.views.get(&page.view).ok_or_else(|| {
                AccessError::Transient(format!("view {} not found", page.view))
            })?;
            let mut out = Vec::new();
            for (id, (seq, body)) in docs.iter() {
                for (key, value) in map(id, body) {
                    out.push(ViewRow {
                        id: Some(id.clone()),
                        key,
                        value,
                        doc: Some(with_meta(id, *seq, body)),
                    });
                }
            }
            out
        };

        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));

        if page.reduce {
            let mut grouped: Vec<ViewRow> = Vec::new();
            for row in rows {
                match grouped.last_mut() {
                    Some(last) if collate(&last.key, &row.key) == Ordering::Equal => {
                        let count = last.value.as_u64().unwrap_or(0) + 1;
                        last.value = json!(count);
                    }
                    _ => grouped.push(ViewRow {
                        id: None,
                        key: row.key,
                        value: json!(1),
                        doc: None,
                    }),
                }
            }
            rows = grouped;
        }

        let filtered = rows
            .into_iter()
            .filter(|row| match &page.start_key {
                None => true,
                Some(start) => match collate(&row.key, start) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => match (&page.start_key_doc_id, &row.id) {
                        (Some(start_id), Some(id)) => id >= start_id,
                        _ => true,
                    },
                },
            })
            .filter(|row| match &page.end_key {
                None => true,
                Some(end) => collate(&row.key, end) != Ordering::Greater,
            })
            .map(|mut row| {
                if !page.include_docs {
                    row.doc = None;
                }
                row
            })
            .take(page.limit)
            .collect();
        Ok(filtered)
    }
}

impl Store for MemoryStore {
    fn query_view(&self, page: &PageRequest) -> Result<Vec<ViewRow>, AccessError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(page.clone());
        if self.failing_views.load(AtomicOrdering::SeqCst) {
            return Err(AccessError::Transient("view unavailable".to_string()));
        }
        self.rows_for(page)
    }

    fn get_document(&self, id: &str) -> Result<Option<Document>, AccessError> {
        let docs = self.docs.lock().expect("docs lock");
        Ok(docs.get(id).map(|(seq, body)| Document {
            id: id.to_string(),
            rev: Some(format!("{seq}-mem")),
            body: with_meta(id, *seq, body),
        }))
    }

    fn put_document(
        &self,
        id: &str,
        body: &Value,
        expected_rev: Option<&str>,
    ) -> Result<String, AccessError> {
        if self.failing_puts.lock().expect("puts lock").contains(id) {
            return Err(AccessError::Transient(format!("write to {id} failed")));
        }
        let mut docs = self.docs.lock().expect("docs lock");
        {
            let mut conflicts = self.injected_conflicts.lock().expect("conflicts lock");
            if let Some(left) = conflicts.get_mut(id)
                && *left > 0
            {
                *left -= 1;
                if let Some((seq, _)) = docs.get_mut(id) {
                    *seq += 1;
                }
                return Err(AccessError::Conflict(id.to_string()));
            }
        }
        let current = docs.get(id).map(|(seq, _)| format!("{seq}-mem"));
        if current.as_deref() != expected_rev {
            return Err(AccessError::Conflict(id.to_string()));
        }
        let seq = docs.get(id).map_or(1, |(seq, _)| seq + 1);
        docs.insert(id.to_string(), (seq, strip_meta(body)));
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(format!("{seq}-mem"))
    }
}

fn is_deleted(doc: &Value) -> bool {
    doc.get("deleted").and_then(flag_value).unwrap_or(false)
}

/// Event log with the views the sync engine reads.
pub fn event_store() -> MemoryStore {
    MemoryStore::new()
        .with_view(EVENTS_BY_TOOLCHAIN_VIEW, |_, doc| {
            let Ok(event) = serde_json::from_value::<Event>(doc.clone()) else {
                return Vec::new();
            };
            event
                .toolchain_id()
                .map(|id| vec![(json!(id.as_str()), Value::Null)])
                .unwrap_or_default()
        })
        .with_view(EVENTS_BY_MINUTE_VIEW, |_, doc| {
            let Ok(event) = serde_json::from_value::<Event>(doc.clone()) else {
                return Vec::new();
            };
            let (Some(id), Some(published)) = (event.toolchain_id(), event.published.as_deref())
            else {
                return Vec::new();
            };
            let minute: String = published.chars().take(16).collect();
            vec![(json!([minute]), json!(id.as_str()))]
        })
        .with_view(JOB_EXECS_BY_TOOLCHAIN_VIEW, |_, doc| {
            if doc.get("kind").and_then(Value::as_str) != Some("job_exec") {
                return Vec::new();
            }
            doc.get("toolchain_id")
                .map(|id| vec![(id.clone(), Value::Null)])
                .unwrap_or_default()
        })
}

/// Warehouse with the views the sync engine reads.
pub fn warehouse_store() -> MemoryStore {
    MemoryStore::new()
        .with_view(TOOLCHAINS_BY_ID_VIEW, |id, _| vec![(json!(id), Value::Null)])
        .with_view(RETAINED_VIEW, |id, doc| {
            if is_deleted(doc) {
                Vec::new()
            } else {
                vec![(json!(id), Value::Null)]
            }
        })
        .with_view(LIVE_DOCS_VIEW, |id, doc| {
            if is_deleted(doc) {
                Vec::new()
            } else {
                vec![(json!(id), Value::Null)]
            }
        })
        .with_view(PLACEHOLDER_VIEW, |id, doc| {
            let placeholder = doc.get("name").and_then(Value::as_str) == Some("deleted");
            let flagged = doc
                .get("no_event_found")
                .and_then(flag_value)
                .unwrap_or(false);
            if placeholder && !flagged {
                vec![(json!(id), Value::Null)]
            } else {
                Vec::new()
            }
        })
}

/// The API-side index database, keyed by organization.
pub fn index_store() -> MemoryStore {
    MemoryStore::new().with_view(SOURCE_INDEX_VIEW, |_, doc| {
        vec![(
            doc.get("organization_guid")
                .cloned()
                .unwrap_or(Value::Null),
            doc.get("toolchain_guid").cloned().unwrap_or(Value::Null),
        )]
    })
}

/// Authoritative API double that counts lookups per id.
pub struct FakeSource {
    records: Mutex<BTreeMap<ToolchainId, Value>>,
    calls: Mutex<BTreeMap<ToolchainId, usize>>,
    failing: Mutex<BTreeSet<ToolchainId>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn put(&self, id: &str, record: Value) {
        self.records
            .lock()
            .expect("records lock")
            .insert(ToolchainId::from(id), record);
    }

    pub fn remove(&self, id: &str) {
        self.records
            .lock()
            .expect("records lock")
            .remove(&ToolchainId::from(id));
    }

    pub fn fail(&self, id: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .insert(ToolchainId::from(id));
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .get(&ToolchainId::from(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("calls lock").values().sum()
    }
}

impl SourceOfTruth for FakeSource {
    fn get_toolchain(&self, id: &ToolchainId) -> Result<Option<ToolchainRecord>, AccessError> {
        *self
            .calls
            .lock()
            .expect("calls lock")
            .entry(id.clone())
            .or_insert(0) += 1;
        if self.failing.lock().expect("failing lock").contains(id) {
            return Err(AccessError::Transient(format!("api lookup for {id} failed")));
        }
        let raw = self.records.lock().expect("records lock").get(id).cloned();
        raw.map(|raw| ToolchainRecord::from_source(id, raw))
            .transpose()
    }

    fn index_ids(&self) -> Result<BTreeSet<ToolchainId>, AccessError> {
        Ok(self
            .records
            .lock()
            .expect("records lock")
            .keys()
            .cloned()
            .collect())
    }
}

pub fn event(verb: &str, toolchain: &str, published: &str) -> Value {
    json!({
        "verb": verb,
        "generator": "otc-core",
        "object": {
            "objectType": "toolchain",
            "id": toolchain,
            "generator": "otc-core",
            "organization": {"id": "org-1"}
        },
        "actor": {"id": "user-1"},
        "published": published
    })
}
