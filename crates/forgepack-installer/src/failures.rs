use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::layout::StoreLayout;

/// A live failure marker owned by this process.
///
/// The exclusive lock on the marker file is held for the life of the handle;
/// other processes treat a locked marker as "an active installer saw this
/// package fail" and will not clear it without force.
#[derive(Debug)]
pub struct FailureMark {
    pkg_id: String,
    path: PathBuf,
    file: File,
}

impl FailureMark {
    pub fn pkg_id(&self) -> &str {
        &self.pkg_id
    }

    /// Release the lock but leave the marker file, so later runs still see
    /// the package as failed once this process exits. Lock calls go through
    /// the trait path; std's own File lock methods shadow fs4 otherwise.
    pub fn release(self) {
        if let Err(err) = fs4::FileExt::unlock(&self.file) {
            warn!(pkg_id = %self.pkg_id, %err, "failed to unlock failure mark");
        }
    }

    /// Release the lock and remove the marker file.
    pub fn clear(self) {
        if let Err(err) = fs4::FileExt::unlock(&self.file) {
            warn!(pkg_id = %self.pkg_id, %err, "failed to unlock failure mark");
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(pkg_id = %self.pkg_id, %err, "failed to remove failure mark");
            }
        }
    }
}

/// Persists per-package "failed to install" markers visible across
/// processes.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    layout: StoreLayout,
}

impl FailureTracker {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Whether any process has marked the package failed.
    pub fn has_failed(&self, pkg_id: &str) -> bool {
        self.layout.failure_mark_path(pkg_id).exists()
    }

    /// Mark the package failed and keep the marker locked so other processes
    /// can tell the failure belongs to a live installer.
    pub fn mark(&self, pkg_id: &str) -> Result<FailureMark> {
        let path = self.layout.failure_mark_path(pkg_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open failure mark {}", path.display()))?;
        fs4::FileExt::lock_exclusive(&file)
            .with_context(|| format!("failed to lock failure mark {}", path.display()))?;
        file.write_all(pkg_id.as_bytes())
            .with_context(|| format!("failed to write failure mark {}", path.display()))?;
        debug!(%pkg_id, "marked as failed");
        Ok(FailureMark {
            pkg_id: pkg_id.to_string(),
            path,
            file,
        })
    }

    /// Clear a failure marker. Without `force`, a marker locked by a live
    /// process is left in place; an unlocked marker is stale and removed.
    pub fn clear(&self, pkg_id: &str, force: bool) -> Result<()> {
        let path = self.layout.failure_mark_path(pkg_id);
        if !path.exists() {
            return Ok(());
        }
        if !force {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .with_context(|| format!("failed to open failure mark {}", path.display()))?;
            match fs4::FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    let _ = fs4::FileExt::unlock(&file);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    debug!(%pkg_id, "failure mark held by a live process; not clearing");
                    return Ok(());
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to probe failure mark {}", path.display())
                    });
                }
            }
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(%pkg_id, "cleared failure mark");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove failure mark {}", path.display()))
            }
        }
    }
}
