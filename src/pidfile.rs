//! Manager pid file: refuses a second manager instance, cleaned up on
//! drop.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Check whether a pid names a live process.
pub fn is_process_running(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

pub struct PidFile {
    path: PathBuf,
    owned: bool,
}

impl PidFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            owned: false,
        }
    }

    /// Returns the pid of a live manager recorded in the file, if any.
    /// A stale file (process gone) is removed.
    pub fn is_running(&self) -> Result<Option<u32>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read pid file {}", self.path.display()))?;
        let pid: u32 = match content.trim().parse() {
            Ok(pid) => pid,
            Err(_) => {
                // Unparseable: treat as stale.
                fs::remove_file(&self.path).ok();
                return Ok(None);
            }
        };

        if is_process_running(pid) {
            Ok(Some(pid))
        } else {
            tracing::debug!(pid, path = %self.path.display(), "Removing stale pid file");
            fs::remove_file(&self.path).ok();
            Ok(None)
        }
    }

    /// Record our own pid. The file is removed again when this value
    /// drops.
    pub fn write(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, std::process::id().to_string())
            .with_context(|| format!("Failed to write pid file {}", self.path.display()))?;
        self.owned = true;
        Ok(())
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if self.owned {
            fs::remove_file(&self.path).ok();
        }
    }
}
