use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SyncPaths {
    pub home: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl SyncPaths {
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("tcsync_state.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("tcsync.lock")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir.join("audit.log")
    }

    /// Export directory from the layered config (`export.dir`, which
    /// `TCSYNC_EXPORT_DIR` overrides); empty means `<home>/exports`.
    pub fn export_dir(&self, configured: &str) -> PathBuf {
        match configured.trim() {
            "" => self.home.join("exports"),
            dir => PathBuf::from(dir),
        }
    }
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<SyncPaths> {
    let home = match env::var("TCSYNC_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join(".tcsync"),
    };

    let state_dir = home.join("state");
    let logs_dir = env_or_default_path("TCSYNC_LOGS_DIR", home.join("logs"));

    Ok(SyncPaths {
        home,
        state_dir,
        logs_dir,
    })
}
