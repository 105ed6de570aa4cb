use crate::error::AccessError;
use crate::sync::model::{ToolchainId, ToolchainRecord};
use crate::sync::scanner::{RowField, ViewQuery, collect_ids};
use crate::sync::store::Store;
use std::collections::BTreeSet;

/// API-side index of every toolchain, keyed by organization with the
/// toolchain guid as the row value.
pub const SOURCE_INDEX_VIEW: &str = "toolchains/org_guids_to_toolchain_guids";

/// The authoritative toolchain API.
pub trait SourceOfTruth: Send + Sync {
    /// `Ok(None)` means the API positively does not know the id.
    fn get_toolchain(&self, id: &ToolchainId) -> Result<Option<ToolchainRecord>, AccessError>;

    /// Every toolchain id the API side currently indexes.
    fn index_ids(&self) -> Result<BTreeSet<ToolchainId>, AccessError>;
}

impl<T: SourceOfTruth + ?Sized> SourceOfTruth for &T {
    fn get_toolchain(&self, id: &ToolchainId) -> Result<Option<ToolchainRecord>, AccessError> {
        (**self).get_toolchain(id)
    }

    fn index_ids(&self) -> Result<BTreeSet<ToolchainId>, AccessError> {
        (**self).index_ids()
    }
}

pub fn index_ids_from_store<S: Store + ?Sized>(
    store: &S,
    batch: usize,
) -> Result<BTreeSet<ToolchainId>, AccessError> {
    let started = std::time::Instant::now();
    let query = ViewQuery::new(SOURCE_INDEX_VIEW, batch);
    let ids = collect_ids(store, query, RowField::Value)?;
    tracing::info!(
        ids = ids.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "collected toolchain ids from source index"
    );
    Ok(ids)
}
