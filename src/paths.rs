//! Filesystem layout: per-user application state, log and data directories.
//!
//! Status files live in an OS-specific per-user state directory, one YAML
//! document per module. Log output goes to a `log/` sibling directory with
//! the last sessions rotated away.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::Result;

/// Number of past session logs kept next to the live one.
pub const KEPT_SESSION_LOGS: usize = 5;

const APP_DIR: &str = "labhost";

/// Per-user application state directory (created on demand).
pub fn app_state_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join(APP_DIR);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Log directory, `log/` under the state directory unless overridden.
pub fn log_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => app_state_dir()?.join("log"),
    };
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Status file for a module: `<state dir>/<module-name>.status.yml`.
pub fn status_file(state_dir: &Path, module_name: &str) -> PathBuf {
    state_dir.join(format!("{module_name}.status.yml"))
}

/// Candidate locations for the configuration file when `--config` is absent:
/// `./labhost.cfg`, then `<user config dir>/labhost/labhost.cfg`.
pub fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from("labhost.cfg");
    if local.is_file() {
        return Some(local);
    }
    let user = dirs::config_dir()?.join(APP_DIR).join("labhost.cfg");
    user.is_file().then_some(user)
}

/// Base directory for module data. Configurable via `global.default_data_dir`;
/// with `daily_data_dirs` a `YYYY-MM-DD` subdirectory is appended so each day
/// of lab work lands in its own folder.
pub fn data_dir(configured: Option<&Path>, daily: bool) -> Result<PathBuf> {
    let mut dir = match configured {
        Some(dir) => dir.to_path_buf(),
        None => app_state_dir()?.join("data"),
    };
    if daily {
        dir = dir.join(Local::now().format("%Y-%m-%d").to_string());
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Shifts previous session logs one slot back (`labhost.log` becomes
/// `labhost.log.1` and so on), dropping the oldest. Call before opening the
/// fresh session log.
pub fn rotate_session_logs(dir: &Path, stem: &str) -> Result<()> {
    let oldest = dir.join(format!("{stem}.log.{}", KEPT_SESSION_LOGS - 1));
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for slot in (1..KEPT_SESSION_LOGS - 1).rev() {
        let from = dir.join(format!("{stem}.log.{slot}"));
        if from.exists() {
            fs::rename(&from, dir.join(format!("{stem}.log.{}", slot + 1)))?;
        }
    }
    let live = dir.join(format!("{stem}.log"));
    if live.exists() {
        fs::rename(&live, dir.join(format!("{stem}.log.1")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn status_file_name_follows_module_name() {
        let path = status_file(Path::new("/state"), "counter");
        assert_eq!(path, Path::new("/state/counter.status.yml"));
    }

    #[test]
    fn rotation_keeps_five_sessions() {
        let dir = tempdir().unwrap();
        for session in 0..8 {
            fs::write(dir.path().join("labhost.log"), format!("session {session}")).unwrap();
            rotate_session_logs(dir.path(), "labhost").unwrap();
        }
        // Slots 1..=4 plus the (not yet created) live file.
        let mut kept: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        kept.sort();
        assert_eq!(
            kept,
            vec!["labhost.log.1", "labhost.log.2", "labhost.log.3", "labhost.log.4"]
        );
        // Most recent session sits in slot 1.
        let newest = fs::read_to_string(dir.path().join("labhost.log.1")).unwrap();
        assert_eq!(newest, "session 7");
    }
}
