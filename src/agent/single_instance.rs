//! Single-instance guard per desktop session
//!
//! The agent holds an exclusive lock on a session-keyed file for its whole
//! lifetime. A second invocation in the same session fails to acquire the
//! lock and exits non-zero immediately; a crashed agent's lock is released
//! by the OS, so the watchdog's respawn always succeeds.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::AgentError;

/// Held for the lifetime of the owning agent
#[derive(Debug)]
pub struct SingleInstanceGuard {
    file: File,
    path: PathBuf,
}

impl SingleInstanceGuard {
    /// Acquires the guard for a session, using the platform temp directory
    ///
    /// # Errors
    ///
    /// Returns `AgentError::AlreadyRunning` when another live agent holds
    /// the session lock.
    pub fn acquire(session: &str) -> Result<Self, AgentError> {
        Self::acquire_in(&std::env::temp_dir(), session)
    }

    /// Acquires the guard with an explicit lock directory
    ///
    /// # Errors
    ///
    /// Returns `AgentError::AlreadyRunning` when the lock is held, and I/O
    /// errors when the lock file cannot be created.
    pub fn acquire_in(dir: &Path, session: &str) -> Result<Self, AgentError> {
        let path = dir.join(format!("deskpilot-agent-{}.lock", sanitize(session)));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(AgentError::AlreadyRunning {
                session: session.to_string(),
            });
        }

        // Best-effort pid breadcrumb for operators inspecting the lock
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        debug!(path = %path.display(), "single-instance lock acquired");
        Ok(Self { file, path })
    }

    /// The lock file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingleInstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(error = %e, "failed to release single-instance lock");
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn sanitize(session: &str) -> String {
    session
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
