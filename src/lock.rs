use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{QdError, Result};

/// Exclusive, non-blocking advisory lock over a job directory.
///
/// Passes for the same job must never overlap; a pass that cannot take the
/// lock gives up immediately instead of waiting. The lock is a marker file
/// created with `create_new` (fails if present) and removed on drop, so a
/// crashed holder leaves a visible lock file for operators to inspect.
#[derive(Debug)]
pub struct JobLock {
    path: PathBuf,
}

impl JobLock {
    pub fn acquire(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", chrono::Utc::now().to_rfc3339());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(QdError::LockBusy(path))
            }
            Err(e) => Err(QdError::io(path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release job lock");
        }
    }
}
