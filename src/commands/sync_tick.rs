use anyhow::Result;

use crate::commands::{CommandReport, add_reconcile_report, connect};
use crate::sync::config::load_config;
use crate::sync::paths::resolve_paths;
use crate::sync::scheduler::{self, TickOutcome};
use crate::sync::state::acquire_lock;

pub fn add_tick_outcome(report: &mut CommandReport, outcome: &TickOutcome) {
    report.detail(format!("tick.since={}", outcome.since));
    report.detail(format!("tick.committed={}", outcome.committed));
    report.detail(format!("tick.events={}", outcome.events));
    add_reconcile_report(report, "tick", &outcome.report);
    if let Some(refresh) = &outcome.full_refresh {
        add_reconcile_report(report, "tick.full_refresh", refresh);
    }
}

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = load_config()?;
    let mut report = CommandReport::new("tick");

    let lock = acquire_lock(&paths)?;
    report.detail(format!("lock_file={}", lock.path().display()));

    let ctx = connect(&cfg)?;
    let outcome = scheduler::run_tick(&paths, &ctx)?;
    add_tick_outcome(&mut report, &outcome);
    Ok(report)
}
