use anyhow::Result;

use crate::commands::{CommandReport, connect};
use crate::sync::config::load_config;
use crate::sync::paths::resolve_paths;
use crate::sync::scheduler;
use crate::sync::state::acquire_lock;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = load_config()?;
    let mut report = CommandReport::new("migrate");

    let lock = acquire_lock(&paths)?;
    report.detail(format!("lock_file={}", lock.path().display()));

    let ctx = connect(&cfg)?;
    let migration = scheduler::run_migration(&paths, &ctx)?;
    report.detail(format!("migrate.passes={}", migration.passes));
    report.detail(format!("migrate.found={}", migration.found));
    report.detail(format!("migrate.restored={}", migration.restored));
    report.detail(format!("migrate.flagged={}", migration.flagged));
    if migration.failed > 0 {
        report.issue(format!(
            "{} placeholder(s) could not be repaired; rerun migrate",
            migration.failed
        ));
    }
    if migration.stalled {
        report.issue("migration stopped: a pass repaired nothing while placeholders remain");
    }
    Ok(report)
}
