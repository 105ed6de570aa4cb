use crate::sync::checkpoint::Checkpoint;
use crate::sync::paths::SyncPaths;
use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Everything that outlives a single tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncState {
    pub schema_version: u32,
    pub checkpoint: Option<Checkpoint>,
    pub last_tick_epoch_secs: Option<u64>,
    pub ticks_since_refresh: u64,
    pub last_full_refresh_epoch_secs: Option<u64>,
    pub last_migration_epoch_secs: Option<u64>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            schema_version: 1,
            checkpoint: None,
            last_tick_epoch_secs: None,
            ticks_since_refresh: 0,
            last_full_refresh_epoch_secs: None,
            last_migration_epoch_secs: None,
        }
    }
}

pub fn load(paths: &SyncPaths) -> Result<SyncState> {
    let file = paths.state_file();
    if !file.exists() {
        return Ok(SyncState::default());
    }

    let raw =
        fs::read_to_string(&file).with_context(|| format!("failed to read {}", file.display()))?;
    let parsed: SyncState = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", file.display()))?;
    Ok(parsed)
}

/// Writes through a temp file and rename so a crash never leaves half a state file.
pub fn save(paths: &SyncPaths, state: &SyncState) -> Result<PathBuf> {
    let file = paths.state_file();
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("failed to create {}", paths.state_dir.display()))?;
    let data = serde_json::to_string_pretty(state)?;
    let tmp = file.with_extension("json.tmp");
    fs::write(&tmp, format!("{data}\n"))
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, &file).with_context(|| format!("failed to replace {}", file.display()))?;
    Ok(file)
}

/// Exclusive hold on the warehouse writer role for this host. Released when dropped.
#[derive(Debug)]
pub struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn acquire_lock(paths: &SyncPaths) -> Result<WriterLock> {
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("failed to create {}", paths.state_dir.display()))?;
    let path = paths.lock_file();
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    if file.try_lock_exclusive().is_err() {
        let holder = fs::read_to_string(&path).unwrap_or_default();
        bail!(
            "another tcsync writer holds {} (pid {})",
            path.display(),
            holder.trim()
        );
    }
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(WriterLock { file, path })
}
