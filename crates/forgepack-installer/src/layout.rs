use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk layout of a forgepack store shared by cooperating installer
/// processes: package prefixes, the install database, per-package lock
/// files, failure markers, the binary cache, and overwrite backups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pkgs_dir(&self) -> PathBuf {
        self.root.join("pkgs")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn failures_dir(&self) -> PathBuf {
        self.root.join("failures")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// Install prefix for a package id.
    pub fn prefix_path(&self, pkg_id: &str) -> PathBuf {
        self.pkgs_dir().join(pkg_id)
    }

    pub fn record_path(&self, pkg_id: &str) -> PathBuf {
        self.db_dir().join(format!("{pkg_id}.json"))
    }

    pub fn lock_path(&self, pkg_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{pkg_id}.lock"))
    }

    pub fn failure_mark_path(&self, pkg_id: &str) -> PathBuf {
        self.failures_dir().join(format!("{pkg_id}.failed"))
    }

    pub fn backup_path(&self, pkg_id: &str) -> PathBuf {
        self.backups_dir().join(format!("{pkg_id}.backup"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.pkgs_dir(),
            self.db_dir(),
            self.locks_dir(),
            self.failures_dir(),
            self.cache_dir(),
            self.backups_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
