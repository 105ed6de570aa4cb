use anyhow::Result;

use crate::commands::{CommandReport, add_reconcile_report, connect};
use crate::sync::config::load_config;
use crate::sync::paths::resolve_paths;
use crate::sync::scheduler::{self, StartupOutcome};
use crate::sync::state::acquire_lock;

pub fn add_startup_outcome(report: &mut CommandReport, outcome: &StartupOutcome) {
    report.detail(format!("startup.unknown_ids={}", outcome.unknown_ids));
    if let Some(refresh) = &outcome.retained_refresh {
        add_reconcile_report(report, "startup.retained", refresh);
    }
    add_reconcile_report(report, "startup.source_index", &outcome.from_source_index);
    add_reconcile_report(report, "startup.event_log", &outcome.from_event_log);
}

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = load_config()?;
    let mut report = CommandReport::new("startup");

    let lock = acquire_lock(&paths)?;
    report.detail(format!("lock_file={}", lock.path().display()));

    let ctx = connect(&cfg)?;
    let outcome = scheduler::run_startup(&paths, &ctx)?;
    add_startup_outcome(&mut report, &outcome);
    report.detail(format!("state_file={}", paths.state_file().display()));
    Ok(report)
}
