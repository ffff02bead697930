use std::collections::BTreeSet;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use forgepack_core::{package_id, PackageSpec};
use tracing::debug;

use crate::cache::BinaryCache;
use crate::db::Database;
use crate::error::InstallError;
use crate::executor::{BuildContext, BuildExecutor, BuildOutcome};
use crate::layout::StoreLayout;
use crate::status::InstallStatusTracker;

/// Global sequence for queue tie-breaking: tasks with equal priority pop in
/// the order they were queued.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Installation status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Queued,
    /// Popped from the queue, about to run.
    Dequeued,
    Installing,
    Installed,
    Failed,
    /// Stale queue entry; ignored on pop. Invalid as an initial status.
    Removed,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Dequeued => "dequeued",
            BuildStatus::Installing => "installing",
            BuildStatus::Installed => "installed",
            BuildStatus::Failed => "failed",
            BuildStatus::Removed => "removed",
        }
    }
}

/// Result of executing one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteResult {
    Success,
    Failed,
    /// The stop-before-phase signal: an early return, not a failure.
    Stopped,
    /// A rewire task found its donor build spec neither installed nor cached;
    /// the scheduler must inject a task that builds the donor first.
    MissingBuildSpec,
}

/// How a task installs its package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Build from source or extract from the binary cache.
    Build,
    /// Re-link a spliced spec against an already-installed donor subtree.
    Rewire,
}

/// Collaborators a task needs while executing. Created by the scheduler per
/// run and threaded through the call graph instead of living as globals.
pub struct ExecuteContext<'a> {
    pub layout: &'a StoreLayout,
    pub db: &'a dyn Database,
    pub cache: Option<&'a dyn BinaryCache>,
    pub executor: &'a dyn BuildExecutor,
    pub status: &'a mut InstallStatusTracker,
    /// Page-global verbosity echo, communicated back from builds so it
    /// persists across subsequent installs.
    pub verbose: &'a mut bool,
}

/// The unit of scheduled work for one package id.
#[derive(Debug, Clone)]
pub struct Task {
    kind: TaskKind,
    pkg: Arc<PackageSpec>,
    request: Arc<crate::request::BuildRequest>,
    pkg_id: String,
    explicit: bool,
    pub(crate) status: BuildStatus,
    start: Option<Instant>,
    attempts: u32,
    sequence: u64,
    /// Cleared after a cache checksum mismatch so the retry builds from
    /// source.
    pub(crate) use_cache: bool,
    dependents: BTreeSet<String>,
    dependencies: BTreeSet<String>,
    uninstalled_deps: BTreeSet<String>,
}

impl Task {
    pub fn new(
        kind: TaskKind,
        pkg: Arc<PackageSpec>,
        request: Arc<crate::request::BuildRequest>,
        explicit: bool,
        status: BuildStatus,
        installed: &BTreeSet<String>,
    ) -> Result<Self> {
        if !pkg.is_concrete() {
            return Err(anyhow!("'{}' must have a concrete spec", pkg.name()));
        }
        if status == BuildStatus::Removed {
            return Err(anyhow!(
                "cannot create a task for {} with status 'removed'",
                package_id(&pkg)
            ));
        }
        let pkg_id = package_id(&pkg);
        let is_installed = |spec: &PackageSpec| installed.contains(&package_id(spec));
        let dependencies: BTreeSet<String> = pkg
            .dependencies(request.depflags_for(&pkg, &is_installed))
            .iter()
            .map(|dep| package_id(dep))
            .filter(|dep_id| *dep_id != pkg_id)
            .collect();
        let uninstalled_deps: BTreeSet<String> = dependencies
            .iter()
            .filter(|dep_id| !installed.contains(*dep_id))
            .cloned()
            .collect();
        Ok(Self {
            kind,
            pkg,
            request,
            pkg_id,
            explicit,
            status,
            start: None,
            attempts: 1,
            sequence: next_sequence(),
            use_cache: true,
            dependents: BTreeSet::new(),
            dependencies,
            uninstalled_deps,
        })
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn pkg(&self) -> &Arc<PackageSpec> {
        &self.pkg
    }

    pub fn request(&self) -> &Arc<crate::request::BuildRequest> {
        &self.request
    }

    pub fn pkg_id(&self) -> &str {
        &self.pkg_id
    }

    pub fn explicit(&self) -> bool {
        self.explicit
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    pub fn start(&self) -> Option<Instant> {
        self.start
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn dependents(&self) -> &BTreeSet<String> {
        &self.dependents
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn uninstalled_deps(&self) -> &BTreeSet<String> {
        &self.uninstalled_deps
    }

    /// Number of outstanding uninstalled dependencies; lower pops first, and
    /// zero means the task is eligible to build.
    pub fn priority(&self) -> usize {
        self.uninstalled_deps.len()
    }

    /// Queue key: `(priority, sequence)`, popped minimum first.
    pub fn key(&self) -> (usize, u64) {
        (self.priority(), self.sequence)
    }

    /// A fresh attempt at this task: incremented attempt count, new sequence
    /// number, start time preserved (defaulted to now), and the uninstalled
    /// set pruned against `installed`. Only the documented mutable fields are
    /// copied; owned collections are never aliased between attempts.
    pub fn next_attempt(&self, installed: &BTreeSet<String>) -> Task {
        Task {
            kind: self.kind,
            pkg: Arc::clone(&self.pkg),
            request: Arc::clone(&self.request),
            pkg_id: self.pkg_id.clone(),
            explicit: self.explicit,
            status: BuildStatus::Queued,
            start: self.start.or_else(|| Some(Instant::now())),
            attempts: self.attempts + 1,
            sequence: next_sequence(),
            use_cache: self.use_cache,
            dependents: self.dependents.clone(),
            dependencies: self.dependencies.clone(),
            uninstalled_deps: self
                .uninstalled_deps
                .iter()
                .filter(|dep_id| !installed.contains(*dep_id))
                .cloned()
                .collect(),
        }
    }

    /// Idempotently record a package that must be notified when this task
    /// finishes.
    pub fn add_dependent(&mut self, dep_id: &str) {
        if dep_id != self.pkg_id && self.dependents.insert(dep_id.to_string()) {
            debug!(pkg_id = %self.pkg_id, dependent = %dep_id, "added dependent");
        }
    }

    /// Idempotently record a dependency; an uninstalled one also raises this
    /// task's priority key.
    pub fn add_dependency(&mut self, dep_id: &str, installed: bool) {
        if dep_id == self.pkg_id {
            return;
        }
        self.dependencies.insert(dep_id.to_string());
        if !installed {
            self.uninstalled_deps.insert(dep_id.to_string());
        }
    }

    pub fn mark_start(&mut self) {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
    }

    /// Run the task under the write lock held by the scheduler.
    pub fn execute(&mut self, ctx: &mut ExecuteContext<'_>) -> Result<ExecuteResult> {
        ctx.status.installing(&self.pkg_id);
        self.mark_start();
        self.status = BuildStatus::Installing;
        match self.kind {
            TaskKind::Build => self.execute_build(ctx),
            TaskKind::Rewire => self.execute_rewire(ctx),
        }
    }

    fn execute_build(&mut self, ctx: &mut ExecuteContext<'_>) -> Result<ExecuteResult> {
        let prefix = ctx.layout.prefix_path(&self.pkg_id);
        let cache_allowed = self.use_cache && self.request.use_cache_for(&self.pkg);
        let cache_only = self.request.cache_only_for(&self.pkg);

        if cache_allowed {
            if self.try_install_from_cache(ctx, &prefix)? {
                return Ok(ExecuteResult::Success);
            }
            debug!(pkg_id = %self.pkg_id, "no binary found, installing from source");
        }
        if cache_only {
            return Err(InstallError::NoBinaryForCacheOnly {
                pkg_id: self.pkg_id.clone(),
            }
            .into());
        }

        if !ctx.executor.pre_install_check(&self.pkg)? {
            debug!(pkg_id = %self.pkg_id, "pre-install check rejected the package");
            return Ok(ExecuteResult::Failed);
        }

        fs::create_dir_all(&prefix)
            .with_context(|| format!("failed to create prefix {}", prefix.display()))?;

        let outcome = ctx.executor.build(
            &self.pkg,
            BuildContext {
                prefix: &prefix,
                explicit: self.explicit,
                verbose: *ctx.verbose || self.request.options().verbose,
                run_tests: self
                    .request
                    .options()
                    .tests
                    .requested_for(self.pkg.name()),
            },
        )?;
        match outcome {
            BuildOutcome::Built { verbose } => {
                *ctx.verbose = verbose;
                // The parent registers the built spec itself rather than
                // re-reading from disk; a separate reader must never see a
                // half-committed entry.
                ctx.db.add(&self.pkg, &prefix, self.explicit)?;
                ctx.status.installed(&self.pkg_id);
                Ok(ExecuteResult::Success)
            }
            BuildOutcome::Stopped => {
                debug!(pkg_id = %self.pkg_id, "build stopped before an install phase");
                Ok(ExecuteResult::Stopped)
            }
        }
    }

    fn try_install_from_cache(
        &mut self,
        ctx: &mut ExecuteContext<'_>,
        prefix: &std::path::Path,
    ) -> Result<bool> {
        let Some(cache) = ctx.cache else {
            return Ok(false);
        };
        let Some(entry) = cache.lookup(&self.pkg)? else {
            return Ok(false);
        };
        debug!(pkg_id = %self.pkg_id, "installing from binary cache");
        cache.extract(&entry, prefix, self.request.options().verify_signatures())?;
        ctx.db.add(&self.pkg, prefix, self.explicit)?;
        ctx.status.installed(&self.pkg_id);
        Ok(true)
    }

    fn execute_rewire(&mut self, ctx: &mut ExecuteContext<'_>) -> Result<ExecuteResult> {
        let donor = self
            .pkg
            .build_spec()
            .ok_or_else(|| anyhow!("rewire task for {} has no build spec", self.pkg_id))?
            .clone();
        let donor_id = package_id(&donor);
        let prefix = ctx.layout.prefix_path(&self.pkg_id);

        let donor_installed = ctx
            .db
            .get_record(&donor_id)?
            .map(|rec| rec.installed)
            .unwrap_or(false);
        if !donor_installed {
            // The spliced spec may exist pre-rewired in the binary cache.
            if self.try_install_from_cache(ctx, &prefix)? {
                return Ok(ExecuteResult::Success);
            }
            debug!(pkg_id = %self.pkg_id, %donor_id, "donor build spec missing");
            return Ok(ExecuteResult::MissingBuildSpec);
        }

        // In-place binary rewire: materialize the donor's payload under this
        // spec's prefix and record the spliced spec as installed.
        let donor_prefix = ctx.layout.prefix_path(&donor_id);
        if prefix.exists() {
            fs::remove_dir_all(&prefix)
                .with_context(|| format!("failed to clear prefix {}", prefix.display()))?;
        }
        crate::cache::copy_dir(&donor_prefix, &prefix)?;
        ctx.db.add(&self.pkg, &prefix, self.explicit)?;
        ctx.status.installed(&self.pkg_id);
        Ok(ExecuteResult::Success)
    }
}
