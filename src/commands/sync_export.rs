use anyhow::Result;
use std::path::PathBuf;

use crate::commands::{CommandReport, connect};
use crate::couch::CouchStore;
use crate::sync::config::load_config;
use crate::sync::paths::resolve_paths;
use crate::sync::report;

const DEFAULT_CSV_NAME: &str = "toolchain_services.csv";
const DEFAULT_JSON_NAME: &str = "toolchains_to_fix.json";

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub csv: Option<PathBuf>,
    pub json: Option<PathBuf>,
}

/// Explicit paths win; with neither given both files land in the export dir.
fn output_paths(
    opts: &ExportOptions,
    export_dir: PathBuf,
) -> (Option<PathBuf>, Option<PathBuf>) {
    if opts.csv.is_none() && opts.json.is_none() {
        return (
            Some(export_dir.join(DEFAULT_CSV_NAME)),
            Some(export_dir.join(DEFAULT_JSON_NAME)),
        );
    }
    (opts.csv.clone(), opts.json.clone())
}

pub fn run(opts: &ExportOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = load_config()?;
    let mut report = CommandReport::new("export");

    let (csv_path, json_path) = output_paths(opts, paths.export_dir(&cfg.export.dir));

    let ctx = connect(&cfg)?;
    let users = CouchStore::connect(&cfg.couch.url, &cfg.couch.users_db, cfg.couch.timeout_secs)?;
    let outcome = report::export(
        &ctx.warehouse,
        &ctx.events,
        &users,
        cfg.scan.id_batch,
        &cfg.export.service_kinds,
        csv_path.as_deref(),
        json_path.as_deref(),
    )?;

    report.detail(format!("export.service_kinds={}", cfg.export.service_kinds.join(",")));
    report.detail(format!("export.toolchains={}", outcome.toolchains));
    report.detail(format!("export.rows={}", outcome.rows));
    report.detail(format!("export.to_fix={}", outcome.to_fix));
    if let Some(path) = &outcome.csv_path {
        report.detail(format!("export.csv={}", path.display()));
    }
    if let Some(path) = &outcome.json_path {
        report.detail(format!("export.json={}", path.display()));
    }
    Ok(report)
}
