use anyhow::Result;
use std::env;

use crate::commands::CommandReport;
use crate::sync::config::{load_config, resolve_config_path};
use crate::sync::paths::resolve_paths;
use crate::sync::state;
use crate::sync::util::mask_credentials;

mod generated {
    include!(concat!(env!("OUT_DIR"), "/tcsync_env_allowlist.rs"));
}

use generated::GENERATED_TCSYNC_ENV_ALLOWLIST;

const SECRET_KEYS: &[&str] = &["TCSYNC_OTC_TOKEN"];

/// `TCSYNC_*` variables currently set, secrets and URLs masked.
fn active_overrides() -> Vec<String> {
    GENERATED_TCSYNC_ENV_ALLOWLIST
        .iter()
        .filter_map(|key| {
            let value = env::var(key).ok()?;
            let shown = if SECRET_KEYS.contains(key) {
                "XXXXX".to_string()
            } else {
                mask_credentials(&value)
            };
            Some(format!("{key}={shown}"))
        })
        .collect()
}

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    report.detail(format!("home={}", paths.home.display()));
    report.detail(format!("state_file={}", paths.state_file().display()));
    report.detail(format!("lock_file={}", paths.lock_file().display()));
    report.detail(format!("audit_log={}", paths.audit_log().display()));
    if let Some(path) = resolve_config_path() {
        let presence = if path.exists() { "" } else { " (absent)" };
        report.detail(format!("config_file={}{presence}", path.display()));
    }

    match load_config() {
        Ok(cfg) => {
            report.detail(format!("couch.url={}", mask_credentials(&cfg.couch.url)));
            report.detail(format!("couch.events_db={}", cfg.couch.events_db));
            report.detail(format!("couch.warehouse_db={}", cfg.couch.warehouse_db));
            report.detail(format!("couch.toolchains_db={}", cfg.couch.toolchains_db));
            report.detail(format!("couch.users_db={}", cfg.couch.users_db));
            report.detail(format!("otc.base_url={}", mask_credentials(&cfg.otc.base_url)));
            report.detail(format!("otc.token_set={}", cfg.otc.token.is_some()));
            report.detail(format!(
                "scheduler.poll_interval_secs={}",
                cfg.scheduler.poll_interval_secs
            ));
            report.detail(format!("scheduler.overlap_secs={}", cfg.scheduler.overlap_secs));
            report.detail(format!(
                "scheduler.full_refresh_every_ticks={}",
                cfg.scheduler.full_refresh_every_ticks
            ));
            report.detail(format!(
                "reconcile.trusted_generator={}",
                cfg.reconcile.trusted_generator
            ));
            report.detail(format!(
                "export_dir={}",
                paths.export_dir(&cfg.export.dir).display()
            ));
        }
        Err(err) => report.issue(format!("invalid configuration: {err:#}")),
    }

    match state::load(&paths) {
        Ok(saved) => {
            let checkpoint = saved
                .checkpoint
                .as_ref()
                .map_or_else(|| "none".to_string(), ToString::to_string);
            report.detail(format!("state.checkpoint={checkpoint}"));
            report.detail(format!(
                "state.ticks_since_refresh={}",
                saved.ticks_since_refresh
            ));
            let epoch = |value: Option<u64>| {
                value.map_or_else(|| "never".to_string(), |v| v.to_string())
            };
            report.detail(format!(
                "state.last_tick_epoch_secs={}",
                epoch(saved.last_tick_epoch_secs)
            ));
            report.detail(format!(
                "state.last_full_refresh_epoch_secs={}",
                epoch(saved.last_full_refresh_epoch_secs)
            ));
            report.detail(format!(
                "state.last_migration_epoch_secs={}",
                epoch(saved.last_migration_epoch_secs)
            ));
        }
        Err(err) => report.issue(format!("unreadable state file: {err:#}")),
    }

    let overrides = active_overrides();
    if overrides.is_empty() {
        report.detail("env_overrides=none");
    }
    for line in overrides {
        report.detail(format!("env_override {line}"));
    }

    Ok(report)
}
