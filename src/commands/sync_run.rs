use anyhow::Result;

use crate::commands::sync_startup::add_startup_outcome;
use crate::commands::sync_tick::add_tick_outcome;
use crate::commands::{CommandReport, connect};
use crate::sync::config::load_config;
use crate::sync::paths::resolve_paths;
use crate::sync::scheduler;
use crate::sync::state::acquire_lock;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub once: bool,
}

pub fn run(opts: &RunOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = load_config()?;
    let mut report = CommandReport::new("run");

    let lock = acquire_lock(&paths)?;
    report.detail(format!("lock_file={}", lock.path().display()));
    if !opts.once {
        report.detail("starting sync daemon");
    }

    let ctx = connect(&cfg)?;
    tracing::info!(
        poll_interval_secs = cfg.scheduler.poll_interval_secs,
        once = opts.once,
        "starting sync"
    );
    let outcome = scheduler::run_daemon(&paths, &ctx, opts.once)?;
    add_startup_outcome(&mut report, &outcome.startup);
    add_tick_outcome(&mut report, &outcome.last_tick);
    report.detail(format!("ticks={}", outcome.ticks));
    Ok(report)
}
