use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use forgepack_core::{package_id, PackageSpec};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::InstallError;
use crate::layout::StoreLayout;

/// A binary cache hit: a pre-built prefix snapshot plus its recorded digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub pkg_id: String,
    pub path: PathBuf,
    pub sha256: String,
}

/// Provider of pre-built package binaries.
pub trait BinaryCache {
    fn lookup(&self, spec: &PackageSpec) -> Result<Option<CacheEntry>>;

    /// Materialize the entry into `prefix`. With `verify`, the snapshot
    /// digest is checked first and a mismatch surfaces as the recoverable
    /// [`InstallError::ChecksumMismatch`].
    fn extract(&self, entry: &CacheEntry, prefix: &Path, verify: bool) -> Result<()>;
}

/// Directory-backed binary cache: one prefix snapshot per package id under
/// `cache/`, with a sibling `.sha256` digest manifest.
#[derive(Debug, Clone)]
pub struct DirCache {
    layout: StoreLayout,
}

impl DirCache {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn entry_dir(&self, pkg_id: &str) -> PathBuf {
        self.layout.cache_dir().join(pkg_id)
    }

    fn digest_path(&self, pkg_id: &str) -> PathBuf {
        self.layout.cache_dir().join(format!("{pkg_id}.sha256"))
    }

    /// Publish a built prefix into the cache (used by tests and by push
    /// tooling layered above this crate).
    pub fn insert(&self, spec: &PackageSpec, prefix: &Path) -> Result<()> {
        let pkg_id = package_id(spec);
        let dir = self.entry_dir(&pkg_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to clear cache entry {}", dir.display()))?;
        }
        copy_dir(prefix, &dir)?;
        let digest = digest_dir(&dir)?;
        fs::write(self.digest_path(&pkg_id), &digest).with_context(|| {
            format!("failed to write cache digest for {pkg_id}")
        })?;
        debug!(%pkg_id, "published to binary cache");
        Ok(())
    }

    /// Path of the digest manifest for a cache entry.
    pub fn digest_manifest_path(&self, pkg_id: &str) -> PathBuf {
        self.digest_path(pkg_id)
    }
}

impl BinaryCache for DirCache {
    fn lookup(&self, spec: &PackageSpec) -> Result<Option<CacheEntry>> {
        let pkg_id = package_id(spec);
        let dir = self.entry_dir(&pkg_id);
        if !dir.is_dir() {
            return Ok(None);
        }
        let sha256 = match fs::read_to_string(self.digest_path(&pkg_id)) {
            Ok(raw) => raw.trim().to_string(),
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read cache digest for {pkg_id}"));
            }
        };
        Ok(Some(CacheEntry {
            pkg_id,
            path: dir,
            sha256,
        }))
    }

    fn extract(&self, entry: &CacheEntry, prefix: &Path, verify: bool) -> Result<()> {
        if verify {
            let actual = digest_dir(&entry.path)?;
            if actual != entry.sha256 {
                return Err(InstallError::ChecksumMismatch {
                    pkg_id: entry.pkg_id.clone(),
                }
                .into());
            }
        }
        if prefix.exists() {
            fs::remove_dir_all(prefix)
                .with_context(|| format!("failed to clear prefix {}", prefix.display()))?;
        }
        copy_dir(&entry.path, prefix)?;
        debug!(pkg_id = %entry.pkg_id, "extracted from binary cache");
        Ok(())
    }
}

/// Digest a directory tree: sorted relative paths and file contents.
pub(crate) fn digest_dir(root: &Path) -> Result<String> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();
    let mut hasher = Sha256::new();
    for rel in files {
        hasher.update(rel.as_bytes());
        let contents = fs::read(root.join(&rel))
            .with_context(|| format!("failed to read {} under {}", rel, root.display()))?;
        hasher.update(&contents);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<String>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("entry must live under its root")
                .to_string_lossy()
                .replace('\\', "/");
            files.push(rel);
        }
    }
    Ok(())
}

/// Recursive tree copy, creating `dest` fresh.
pub(crate) fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let entries = fs::read_dir(src).with_context(|| format!("failed to list {}", src.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", src.display()))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).with_context(|| {
                format!("failed to copy {} to {}", from.display(), to.display())
            })?;
        }
    }
    Ok(())
}
