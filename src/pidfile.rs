//! Process identity marker

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{PanelError, PanelResult};

/// A pid file owned by this process, removed on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `path` for the current process.
    ///
    /// A file left behind by a dead process is replaced; one owned by a live
    /// process is an `AlreadyExists` error.
    pub fn acquire(path: impl AsRef<Path>) -> PanelResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(pid) = Self::running_pid(&path) {
            return Err(PanelError::AlreadyExists(format!(
                "Another instance is running with PID {} ({})",
                pid,
                path.display()
            )));
        }

        if path.exists() {
            info!("Replacing stale pid file {}", path.display());
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        debug!("Wrote pid file {}", path.display());

        Ok(Self { path })
    }

    /// PID recorded at `path` if that process is still alive
    pub fn running_pid(path: impl AsRef<Path>) -> Option<i32> {
        let content = fs::read_to_string(path.as_ref()).ok()?;
        let pid: i32 = content.trim().parse().ok()?;
        if pid > 0 && pid as u32 != std::process::id() && process_alive(pid) {
            Some(pid)
        } else {
            None
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove pid file {}: {}", self.path.display(), e);
        }
    }
}

fn process_alive(pid: i32) -> bool {
    // Signal 0 only checks existence; EPERM still means the process exists
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
