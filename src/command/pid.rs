//! Pid files in the state directory, one per running session
//!
//! File names are `<component>-<pid>.pid`. The clean command uses them to
//! tell whether any connect session is still alive on this machine.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::AppResult;

/// Removes its file when dropped
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(state_dir: &Path, component: &str) -> AppResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let pid = std::process::id();
        let path = state_dir.join(format!("{}-{}.pid", component, pid));
        std::fs::write(&path, pid.to_string())?;
        debug!(path = %path.display(), "Wrote pid file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Split `connect-1234.pid` into `("connect", 1234)`
pub fn parse_pid_file_name(file_name: &str) -> Option<(String, u32)> {
    let stem = file_name.strip_suffix(".pid")?;
    let (component, pid) = stem.rsplit_once('-')?;
    if component.is_empty() {
        return None;
    }
    Some((component.to_string(), pid.parse().ok()?))
}

pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 only checks that the process exists; EPERM means it does
        // but belongs to another user
        let ret = unsafe { libc::kill(pid, 0) };
        ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// A pid file found in the state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidEntry {
    pub component: String,
    pub pid: u32,
    pub path: PathBuf,
}

pub fn list_pid_files(state_dir: &Path) -> Vec<PidEntry> {
    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut found: Vec<PidEntry> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let (component, pid) = parse_pid_file_name(&name)?;
            Some(PidEntry {
                component,
                pid,
                path: entry.path(),
            })
        })
        .collect();
    found.sort_by(|a, b| a.path.cmp(&b.path));
    found
}

/// Delete pid files whose process is gone. With `dry_run` nothing is removed.
/// Returns the entries whose process is still alive.
pub fn clean_pid_files(state_dir: &Path, dry_run: bool) -> Vec<PidEntry> {
    let mut alive = Vec::new();
    for entry in list_pid_files(state_dir) {
        if is_process_alive(entry.pid) {
            debug!(component = %entry.component, pid = entry.pid, "Found live instance");
            alive.push(entry);
        } else if dry_run {
            info!(path = %entry.path.display(), "Would remove remnant pid file");
        } else {
            info!(path = %entry.path.display(), "Removing remnant pid file");
            if let Err(e) = std::fs::remove_file(&entry.path) {
                warn!(path = %entry.path.display(), error = %e, "Failed to remove pid file");
            }
        }
    }
    alive
}
