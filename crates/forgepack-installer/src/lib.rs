//! Concurrent package installation for a shared forgepack store.
//!
//! The [`PackageInstaller`] coordinates builds for one store instance by
//! walking the dependency DAG bottom-up: tasks with no uninstalled
//! dependencies are popped first, and per-package file locks let independent
//! OS processes (local parallel jobs, or distributed builds on a shared
//! filesystem) cooperate on the same store without a central coordinator.
//!
//! A failed dependency removes its dependents' tasks from this process's
//! queue and leaves a locked failure marker on disk so other processes can
//! prune their own queues; unrelated subgraphs keep installing.

mod cache;
mod db;
mod error;
mod executor;
mod failures;
mod installer;
mod layout;
mod lock;
mod overwrite;
mod queue;
mod request;
mod status;
mod task;

pub use cache::{BinaryCache, CacheEntry, DirCache};
pub use db::{Database, FsDatabase, InstallRecord};
pub use error::{InstallError, LockError};
pub use executor::{BuildContext, BuildExecutor, BuildOutcome};
pub use failures::{FailureMark, FailureTracker};
pub use installer::PackageInstaller;
pub use layout::StoreLayout;
pub use lock::{LockKind, PrefixLock};
pub use overwrite::OverwriteInstall;
pub use request::{BuildRequest, InstallOptions, TestsPolicy};
pub use status::{InstallStatusTracker, TermStatusLine};
pub use task::{BuildStatus, ExecuteContext, ExecuteResult, Task, TaskKind};

#[cfg(test)]
mod tests;
