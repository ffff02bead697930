use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use forgepack_core::{package_id, PackageSpec};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::layout::StoreLayout;

/// One installed-package record in the shared database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub pkg_id: String,
    pub name: String,
    pub version: String,
    pub dag_hash: String,
    pub prefix: String,
    pub explicit: bool,
    pub installed: bool,
    pub installed_at_unix: u64,
}

/// The shared install database. Mutation for a package is only legal while
/// holding that package's write lock; the scheduler enforces this.
pub trait Database {
    fn get_record(&self, pkg_id: &str) -> Result<Option<InstallRecord>>;

    fn add(&self, spec: &PackageSpec, prefix: &Path, explicit: bool) -> Result<()>;

    fn remove(&self, pkg_id: &str) -> Result<()>;

    fn update_explicit(&self, pkg_id: &str, explicit: bool) -> Result<()>;

    /// Whether some *other* spec's record claims this install prefix.
    fn is_occupied_install_prefix(&self, pkg_id: &str, prefix: &Path) -> Result<bool>;
}

/// Filesystem-backed database: one JSON record per package id.
#[derive(Debug, Clone)]
pub struct FsDatabase {
    layout: StoreLayout,
}

impl FsDatabase {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn write_record(&self, record: &InstallRecord) -> Result<()> {
        let path = self.layout.record_path(&record.pkg_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(record)
            .with_context(|| format!("failed to serialize record for {}", record.pkg_id))?;
        fs::write(&path, raw)
            .with_context(|| format!("failed to write db record {}", path.display()))?;
        Ok(())
    }
}

impl Database for FsDatabase {
    fn get_record(&self, pkg_id: &str) -> Result<Option<InstallRecord>> {
        let path = self.layout.record_path(pkg_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read db record {}", path.display()));
            }
        };
        let record: InstallRecord = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse db record {}", path.display()))?;
        Ok(Some(record))
    }

    fn add(&self, spec: &PackageSpec, prefix: &Path, explicit: bool) -> Result<()> {
        let pkg_id = package_id(spec);
        let installed_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system time is before unix epoch")?
            .as_secs();
        let record = InstallRecord {
            pkg_id: pkg_id.clone(),
            name: spec.name().to_string(),
            version: spec.version().to_string(),
            dag_hash: spec.dag_hash().to_string(),
            prefix: prefix.display().to_string(),
            explicit,
            installed: true,
            installed_at_unix,
        };
        self.write_record(&record)?;
        debug!(%pkg_id, explicit, "registered in database");
        Ok(())
    }

    fn remove(&self, pkg_id: &str) -> Result<()> {
        let path = self.layout.record_path(pkg_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove db record {}", path.display()))
            }
        }
    }

    fn update_explicit(&self, pkg_id: &str, explicit: bool) -> Result<()> {
        let Some(mut record) = self.get_record(pkg_id)? else {
            return Ok(());
        };
        if record.explicit != explicit {
            record.explicit = explicit;
            self.write_record(&record)?;
            debug!(%pkg_id, explicit, "updated explicit marking");
        }
        Ok(())
    }

    fn is_occupied_install_prefix(&self, pkg_id: &str, prefix: &Path) -> Result<bool> {
        let dir = self.layout.db_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list db records in {}", dir.display()));
            }
        };
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to list db records in {}", dir.display()))?;
            let raw = match fs::read_to_string(entry.path()) {
                Ok(raw) => raw,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to read db record {}", entry.path().display())
                    });
                }
            };
            let Ok(record) = serde_json::from_str::<InstallRecord>(&raw) else {
                continue;
            };
            if record.pkg_id != pkg_id && record.prefix == prefix.display().to_string() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
