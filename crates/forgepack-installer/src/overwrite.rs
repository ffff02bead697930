use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, warn};

use crate::db::Database;
use crate::layout::StoreLayout;
use crate::task::{ExecuteContext, ExecuteResult, Task};

/// Transactional replace-in-place for a package that must be reinstalled
/// over its existing prefix: back up the prefix, delegate to the real task
/// execution, and restore the backup if the install does not complete.
pub struct OverwriteInstall<'a> {
    layout: &'a StoreLayout,
    db: &'a dyn Database,
}

impl<'a> OverwriteInstall<'a> {
    pub fn new(layout: &'a StoreLayout, db: &'a dyn Database) -> Self {
        Self { layout, db }
    }

    pub fn install(
        &self,
        task: &mut Task,
        ctx: &mut ExecuteContext<'_>,
    ) -> Result<ExecuteResult> {
        let pkg_id = task.pkg_id().to_string();
        let prefix = self.layout.prefix_path(&pkg_id);
        let backup = self.layout.backup_path(&pkg_id);

        let backed_up = prefix.exists();
        if backed_up {
            if backup.exists() {
                fs::remove_dir_all(&backup).with_context(|| {
                    format!("failed to clear stale backup {}", backup.display())
                })?;
            }
            fs::rename(&prefix, &backup).with_context(|| {
                format!(
                    "failed to back up {} to {}",
                    prefix.display(),
                    backup.display()
                )
            })?;
        }

        match task.execute(ctx) {
            Ok(ExecuteResult::Success) => {
                if backed_up {
                    let _ = fs::remove_dir_all(&backup);
                }
                Ok(ExecuteResult::Success)
            }
            Ok(result) => {
                // Stopped or failed: the overwrite did not complete, so the
                // previous install comes back.
                if backed_up {
                    self.restore(&pkg_id, &prefix, &backup)?;
                }
                Ok(result)
            }
            Err(err) => {
                if backed_up {
                    if let Err(restore_err) = self.restore(&pkg_id, &prefix, &backup) {
                        // The prefix is gone and the backup is unusable; the
                        // database record no longer describes anything real.
                        // Surface the original installation error, never the
                        // restore error.
                        error!(
                            %pkg_id,
                            %restore_err,
                            "could not restore backup; removing database record",
                        );
                        if let Err(db_err) = self.db.remove(&pkg_id) {
                            warn!(%pkg_id, %db_err, "failed to remove database record");
                        }
                    }
                }
                Err(err)
            }
        }
    }

    fn restore(&self, pkg_id: &str, prefix: &Path, backup: &Path) -> Result<()> {
        if prefix.exists() {
            fs::remove_dir_all(prefix).with_context(|| {
                format!("failed to clear partial install {}", prefix.display())
            })?;
        }
        fs::rename(backup, prefix).with_context(|| {
            format!(
                "failed to restore backup of {} from {}",
                pkg_id,
                backup.display()
            )
        })?;
        Ok(())
    }
}
