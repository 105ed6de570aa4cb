use anyhow::Result;

use crate::commands::{CommandReport, add_reconcile_report, connect};
use crate::sync::config::load_config;
use crate::sync::paths::resolve_paths;
use crate::sync::scheduler;
use crate::sync::state::acquire_lock;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = load_config()?;
    let mut report = CommandReport::new("refresh");

    let lock = acquire_lock(&paths)?;
    report.detail(format!("lock_file={}", lock.path().display()));

    let ctx = connect(&cfg)?;
    let pass = scheduler::run_full_refresh(&paths, &ctx)?;
    add_reconcile_report(&mut report, "refresh", &pass);
    Ok(report)
}
