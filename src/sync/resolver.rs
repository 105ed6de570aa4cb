use crate::sync::event_log::EventLog;
use crate::sync::model::ToolchainId;
use crate::sync::source::SourceOfTruth;
use crate::sync::store::Store;
use crate::sync::warehouse::Warehouse;
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeSet;
use std::thread;

/// Full-population id sets from the three systems.
#[derive(Debug, Clone, Default)]
pub struct IdSets {
    pub event_log: BTreeSet<ToolchainId>,
    pub source_index: BTreeSet<ToolchainId>,
    pub warehouse: BTreeSet<ToolchainId>,
}

impl IdSets {
    /// Ids some system knows about that the warehouse has never recorded.
    pub fn unknown(&self) -> BTreeSet<ToolchainId> {
        self.event_log
            .union(&self.source_index)
            .filter(|id| !self.warehouse.contains(*id))
            .cloned()
            .collect()
    }

    pub fn missing_from_source_index(&self) -> BTreeSet<ToolchainId> {
        self.source_index
            .difference(&self.warehouse)
            .cloned()
            .collect()
    }

    /// Event-log ids the warehouse lacks, minus those written since the sets
    /// were loaded.
    pub fn missing_from_event_log(
        &self,
        written: &BTreeSet<ToolchainId>,
    ) -> BTreeSet<ToolchainId> {
        self.event_log
            .iter()
            .filter(|id| !self.warehouse.contains(*id) && !written.contains(*id))
            .cloned()
            .collect()
    }
}

/// Loads the three id sets concurrently. Any failed scan fails the whole load.
pub fn resolve<W, E, S>(
    warehouse: &Warehouse<W>,
    events: &EventLog<E>,
    source: &S,
) -> Result<IdSets>
where
    W: Store,
    E: Store,
    S: SourceOfTruth,
{
    thread::scope(|scope| {
        let from_events = scope.spawn(|| events.all_ids());
        let from_source = scope.spawn(|| source.index_ids());
        let from_warehouse = scope.spawn(|| warehouse.all_ids());

        let event_log = joined("event log", from_events)?.context("event log id scan failed")?;
        let source_index =
            joined("source index", from_source)?.context("source index id scan failed")?;
        let warehouse =
            joined("warehouse", from_warehouse)?.context("warehouse id scan failed")?;

        tracing::info!(
            event_log = event_log.len(),
            source_index = source_index.len(),
            warehouse = warehouse.len(),
            "resolved toolchain id sets"
        );
        Ok(IdSets {
            event_log,
            source_index,
            warehouse,
        })
    })
}

fn joined<T>(name: &str, handle: thread::ScopedJoinHandle<'_, T>) -> Result<T> {
    handle
        .join()
        .map_err(|_| anyhow!("{name} id scan panicked"))
}
