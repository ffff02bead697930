use thiserror::Error;

/// Errors raised while installing packages.
///
/// Most variants are fatal for a single package: the scheduler records the
/// failure, prunes dependents, and keeps going unless `fail_fast` is set.
/// `ChecksumMismatch` is the recoverable exception; the scheduler requeues
/// the task for a source build instead of failing it.
#[derive(Debug, Error)]
pub enum InstallError {
    /// A task was popped with uninstalled dependencies. This is a scheduler
    /// bug, never a package problem, and aborts the whole run.
    #[error("cannot proceed with {pkg_id}: {count} uninstalled {}: {deps}",
            if *count == 1 { "dependency" } else { "dependencies" })]
    Scheduler {
        pkg_id: String,
        count: usize,
        deps: String,
    },

    #[error("{pkg_id} cannot be installed locally: is external")]
    ExternalPackage { pkg_id: String },

    #[error("{pkg_id} cannot be installed locally: is upstream")]
    Upstream { pkg_id: String },

    #[error("{pkg_id} cannot be installed locally: not locked")]
    LockFailure { pkg_id: String },

    #[error("install prefix {prefix} already occupied by a different spec")]
    PrefixCollision { prefix: String },

    #[error("no binary for {pkg_id} found when cache-only was specified")]
    NoBinaryForCacheOnly { pkg_id: String },

    /// Binary cache entry exists but its checksum does not match. Recoverable:
    /// disable cache use for the task and rebuild from source.
    #[error("checksum mismatch for binary cache entry of {pkg_id}")]
    ChecksumMismatch { pkg_id: String },

    #[error("cannot proceed with {pkg_id}: {reason}")]
    FailedDependency { pkg_id: String, reason: String },

    #[error("installation of {failed} failed; review the install logs for details")]
    Aggregate { failed: String },
}

/// Lock acquisition failures, kept distinguishable so the scheduler can treat
/// a timeout as "busy elsewhere, requeue" and a downgrade error as a protocol
/// violation.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out waiting for a {kind} lock on {pkg_id}")]
    Timeout { pkg_id: String, kind: &'static str },

    #[error("cannot downgrade lock on {pkg_id}: not write locked")]
    Downgrade { pkg_id: String },

    #[error("lock I/O failure on {pkg_id}: {source}")]
    Io {
        pkg_id: String,
        #[source]
        source: std::io::Error,
    },
}
