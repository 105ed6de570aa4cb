use crate::error::AccessError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of a view result. Reduced rows carry no document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

/// A single page request against a view. Built by the scanner; callers describe
/// whole scans with [`crate::sync::scanner::ViewQuery`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageRequest {
    /// `design_doc/view_name`, or `_all_docs`.
    pub view: String,
    pub reduce: bool,
    pub group: bool,
    pub include_docs: bool,
    pub start_key: Option<Value>,
    pub start_key_doc_id: Option<String>,
    /// Inclusive upper bound.
    pub end_key: Option<Value>,
    pub limit: usize,
}

/// A stored document with its revision token.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub rev: Option<String>,
    pub body: Value,
}

/// Document store with map/reduce views and optimistic writes.
///
/// Implementations block until the call completes; connection-level timeouts
/// are their responsibility.
pub trait Store: Send + Sync {
    fn query_view(&self, page: &PageRequest) -> Result<Vec<ViewRow>, AccessError>;

    fn get_document(&self, id: &str) -> Result<Option<Document>, AccessError>;

    /// Writes `body` under `id`. `expected_rev` must match the stored revision
    /// (or be `None` for a new document), otherwise the call fails with
    /// [`AccessError::Conflict`]. Returns the new revision.
    fn put_document(
        &self,
        id: &str,
        body: &Value,
        expected_rev: Option<&str>,
    ) -> Result<String, AccessError>;
}

impl<T: Store + ?Sized> Store for &T {
    fn query_view(&self, page: &PageRequest) -> Result<Vec<ViewRow>, AccessError> {
        (**self).query_view(page)
    }

    fn get_document(&self, id: &str) -> Result<Option<Document>, AccessError> {
        (**self).get_document(id)
    }

    fn put_document(
        &self,
        id: &str,
        body: &Value,
        expected_rev: Option<&str>,
    ) -> Result<String, AccessError> {
        (**self).put_document(id, body, expected_rev)
    }
}
