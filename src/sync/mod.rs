pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod event_log;
pub mod migrate;
pub mod model;
pub mod paths;
pub mod provenance;
pub mod reconcile;
pub mod report;
pub mod resolver;
pub mod scanner;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod store;
pub mod util;
pub mod warehouse;

#[cfg(test)]
pub mod testing;
