use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_COUCH_URL: &str = "http://127.0.0.1:5984";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CouchConfig {
    pub url: String,
    pub events_db: String,
    pub warehouse_db: String,
    pub toolchains_db: String,
    pub users_db: String,
    pub timeout_secs: u64,
}

impl Default for CouchConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            events_db: "metrics-events".to_string(),
            warehouse_db: "metrics-warehouse".to_string(),
            toolchains_db: "otc-api-toolchains".to_string(),
            users_db: "metrics-users-dw".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtcConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for OtcConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub overlap_secs: u64,
    pub full_refresh_every_ticks: u64,
    pub startup_refresh_retained: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            overlap_secs: 60,
            full_refresh_every_ticks: 360,
            startup_refresh_retained: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub event_batch: usize,
    pub id_batch: usize,
    pub index_batch: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            event_batch: 1000,
            id_batch: 20_000,
            index_batch: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub conflict_retries: usize,
    pub trusted_generator: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 2,
            trusted_generator: "otc-core".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    pub batch: usize,
    pub placeholder_name: String,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            batch: 1000,
            placeholder_name: "deleted".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Empty means `<home>/exports`.
    pub dir: String,
    pub service_kinds: Vec<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            service_kinds: vec![
                "github".to_string(),
                "githubpublic".to_string(),
                "hostedgit".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    pub couch: CouchConfig,
    pub otc: OtcConfig,
    pub scheduler: SchedulerConfig,
    pub scan: ScanConfig,
    pub reconcile: ReconcileConfig,
    pub migrate: MigrateConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSyncConfig {
    couch: Option<CouchConfig>,
    otc: Option<OtcConfig>,
    scheduler: Option<SchedulerConfig>,
    scan: Option<ScanConfig>,
    reconcile: Option<ReconcileConfig>,
    migrate: Option<MigrateConfig>,
    export: Option<ExportConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

/// Store URL from a Cloud Foundry `VCAP_SERVICES` binding, if one is present.
fn vcap_couch_url(raw: &str) -> Option<String> {
    let services: Value = serde_json::from_str(raw).ok()?;
    services
        .get("cloudantNoSQLDB")?
        .get(0)?
        .get("credentials")?
        .get("url")?
        .as_str()
        .map(ToOwned::to_owned)
}

fn validate(cfg: &SyncConfig) -> Result<()> {
    if cfg.couch.url.trim().is_empty() {
        return Err(anyhow!("invalid couch url: cannot be empty"));
    }
    reqwest::Url::parse(&cfg.couch.url)
        .map_err(|err| anyhow!("invalid couch url: {err}"))?;
    reqwest::Url::parse(&cfg.otc.base_url)
        .map_err(|err| anyhow!("invalid otc base url: {err}"))?;
    for (name, db) in [
        ("events_db", &cfg.couch.events_db),
        ("warehouse_db", &cfg.couch.warehouse_db),
        ("toolchains_db", &cfg.couch.toolchains_db),
        ("users_db", &cfg.couch.users_db),
    ] {
        if db.trim().is_empty() {
            return Err(anyhow!("invalid couch {name}: cannot be empty"));
        }
    }
    if cfg.couch.timeout_secs == 0 || cfg.otc.timeout_secs == 0 {
        return Err(anyhow!("invalid timeout: must be >= 1 second"));
    }
    if cfg.scheduler.poll_interval_secs == 0 {
        return Err(anyhow!(
            "invalid scheduler poll interval: must be >= 1 second"
        ));
    }
    if cfg.scheduler.overlap_secs == 0 || cfg.scheduler.overlap_secs > 3600 {
        return Err(anyhow!(
            "invalid scheduler overlap: require 1 <= overlap <= 3600 seconds"
        ));
    }
    if cfg.scheduler.full_refresh_every_ticks == 0 {
        return Err(anyhow!("invalid full refresh cadence: must be >= 1 tick"));
    }
    if cfg.scan.event_batch == 0 || cfg.scan.id_batch == 0 || cfg.scan.index_batch == 0 {
        return Err(anyhow!("invalid scan batch size: must be >= 1"));
    }
    if cfg.reconcile.trusted_generator.trim().is_empty() {
        return Err(anyhow!("invalid trusted generator: cannot be empty"));
    }
    if cfg.migrate.batch == 0 {
        return Err(anyhow!("invalid migrate batch: must be >= 1"));
    }
    if cfg.migrate.placeholder_name.trim().is_empty() {
        return Err(anyhow!("invalid placeholder name: cannot be empty"));
    }
    Ok(())
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("TCSYNC_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".tcsync").join("tcsync.toml"))
}

fn merge_file_config(base: &mut SyncConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialSyncConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse tcsync config {}: {err}", path.display()))?;
    if let Some(couch) = parsed.couch {
        base.couch = couch;
    }
    if let Some(otc) = parsed.otc {
        base.otc = otc;
    }
    if let Some(scheduler) = parsed.scheduler {
        base.scheduler = scheduler;
    }
    if let Some(scan) = parsed.scan {
        base.scan = scan;
    }
    if let Some(reconcile) = parsed.reconcile {
        base.reconcile = reconcile;
    }
    if let Some(migrate) = parsed.migrate {
        base.migrate = migrate;
    }
    if let Some(export) = parsed.export {
        base.export = export;
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut SyncConfig) {
    cfg.couch.url = env_or_string("TCSYNC_COUCH_URL", &cfg.couch.url);
    if cfg.couch.url.trim().is_empty() {
        cfg.couch.url = env::var("VCAP_SERVICES")
            .ok()
            .and_then(|raw| vcap_couch_url(&raw))
            .unwrap_or_else(|| DEFAULT_COUCH_URL.to_string());
    }
    cfg.couch.events_db = env_or_string("TCSYNC_EVENTS_DB", &cfg.couch.events_db);
    cfg.couch.warehouse_db = env_or_string("TCSYNC_WAREHOUSE_DB", &cfg.couch.warehouse_db);
    cfg.couch.toolchains_db = env_or_string("TCSYNC_TOOLCHAINS_DB", &cfg.couch.toolchains_db);
    cfg.couch.users_db = env_or_string("TCSYNC_USERS_DB", &cfg.couch.users_db);
    cfg.couch.timeout_secs = env_or_u64("TCSYNC_COUCH_TIMEOUT_SECS", cfg.couch.timeout_secs);

    cfg.otc.base_url = env_or_string("TCSYNC_OTC_BASE_URL", &cfg.otc.base_url);
    if let Ok(token) = env::var("TCSYNC_OTC_TOKEN")
        && !token.trim().is_empty()
    {
        cfg.otc.token = Some(token.trim().to_string());
    }
    cfg.otc.timeout_secs = env_or_u64("TCSYNC_OTC_TIMEOUT_SECS", cfg.otc.timeout_secs);

    cfg.scheduler.poll_interval_secs = env_or_u64(
        "TCSYNC_POLL_INTERVAL_SECS",
        cfg.scheduler.poll_interval_secs,
    );
    cfg.scheduler.overlap_secs = env_or_u64("TCSYNC_OVERLAP_SECS", cfg.scheduler.overlap_secs);
    cfg.scheduler.full_refresh_every_ticks = env_or_u64(
        "TCSYNC_FULL_REFRESH_EVERY_TICKS",
        cfg.scheduler.full_refresh_every_ticks,
    );
    cfg.scheduler.startup_refresh_retained = env_or_bool(
        "TCSYNC_STARTUP_REFRESH_RETAINED",
        cfg.scheduler.startup_refresh_retained,
    );

    cfg.scan.event_batch = env_or_usize("TCSYNC_EVENT_BATCH", cfg.scan.event_batch);
    cfg.scan.id_batch = env_or_usize("TCSYNC_ID_BATCH", cfg.scan.id_batch);
    cfg.scan.index_batch = env_or_usize("TCSYNC_INDEX_BATCH", cfg.scan.index_batch);

    cfg.reconcile.conflict_retries =
        env_or_usize("TCSYNC_CONFLICT_RETRIES", cfg.reconcile.conflict_retries);
    cfg.reconcile.trusted_generator =
        env_or_string("TCSYNC_TRUSTED_GENERATOR", &cfg.reconcile.trusted_generator);

    cfg.migrate.batch = env_or_usize("TCSYNC_MIGRATE_BATCH", cfg.migrate.batch);
    cfg.migrate.placeholder_name =
        env_or_string("TCSYNC_PLACEHOLDER_NAME", &cfg.migrate.placeholder_name);

    cfg.export.dir = env_or_string("TCSYNC_EXPORT_DIR", &cfg.export.dir);
    cfg.export.service_kinds =
        env_or_csv("TCSYNC_EXPORT_SERVICE_KINDS", &cfg.export.service_kinds);
}

pub fn load_config() -> Result<SyncConfig> {
    let mut cfg = SyncConfig::default();
    merge_file_config(&mut cfg)?;
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}
