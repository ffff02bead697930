use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use forgepack_core::{package_id, PackageSpec};
use tracing::{debug, error, info, warn};

use crate::cache::BinaryCache;
use crate::db::{Database, InstallRecord};
use crate::error::{InstallError, LockError};
use crate::executor::BuildExecutor;
use crate::failures::{FailureMark, FailureTracker};
use crate::layout::StoreLayout;
use crate::lock::{LockKind, PrefixLock};
use crate::overwrite::OverwriteInstall;
use crate::queue::TaskQueue;
use crate::request::{BuildRequest, InstallOptions};
use crate::status::InstallStatusTracker;
use crate::task::{BuildStatus, ExecuteContext, ExecuteResult, Task, TaskKind};

/// Write-lock attempts are deliberately near zero so the scheduler iterates
/// quickly through many specs instead of blocking on one.
const WRITE_LOCK_TIMEOUT: Duration = Duration::ZERO;

/// Read-lock attempts wait a few seconds when other ready work exists;
/// with nothing else to do they block until the other process finishes.
const READ_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// What to do with a package the database already considers installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallAction {
    /// Another process already overwrote it after our overwrite decision.
    None,
    /// Normal path: not in the overwrite set, not actually installed, or
    /// the prefix is missing.
    Install,
    /// Genuinely needs a transactional replace-in-place.
    Overwrite,
}

/// Bottom-up DAG scheduler coordinating concurrent builds for one store.
///
/// Tasks with no uninstalled dependencies pop first; per-package file locks
/// coordinate with other installer processes sharing the store; dependents
/// of failed packages are pruned rather than aborting unrelated subgraphs.
pub struct PackageInstaller<'a> {
    layout: StoreLayout,
    db: &'a dyn Database,
    cache: Option<&'a dyn BinaryCache>,
    executor: &'a dyn BuildExecutor,
    failure_tracker: FailureTracker,
    requests: Vec<Arc<BuildRequest>>,
    queue: TaskQueue,
    locks: HashMap<String, (LockKind, Option<PrefixLock>)>,
    installed: BTreeSet<String>,
    failed: BTreeMap<String, Option<FailureMark>>,
    all_dependents: BTreeMap<String, BTreeSet<String>>,
    fail_fast: bool,
    verbose: bool,
    status: InstallStatusTracker,
}

impl<'a> PackageInstaller<'a> {
    /// Build one request per explicitly requested top-level package. If any
    /// request sets `fail_fast`, it applies to the whole run.
    pub fn new(
        layout: StoreLayout,
        db: &'a dyn Database,
        cache: Option<&'a dyn BinaryCache>,
        executor: &'a dyn BuildExecutor,
        packages: Vec<(Arc<PackageSpec>, InstallOptions)>,
    ) -> Result<Self> {
        layout.ensure_base_dirs()?;
        let failure_tracker = FailureTracker::new(layout.clone());
        let mut requests = Vec::with_capacity(packages.len());
        let mut fail_fast = false;
        for (pkg, options) in packages {
            fail_fast = fail_fast || options.fail_fast;
            let request = BuildRequest::new(pkg, options, |spec| {
                db.get_record(&package_id(spec))
                    .ok()
                    .flatten()
                    .map(|rec| rec.installed)
                    .unwrap_or(false)
            })?;
            requests.push(Arc::new(request));
        }
        Ok(Self {
            layout,
            db,
            cache,
            executor,
            failure_tracker,
            requests,
            queue: TaskQueue::new(),
            locks: HashMap::new(),
            installed: BTreeSet::new(),
            failed: BTreeMap::new(),
            all_dependents: BTreeMap::new(),
            fail_fast,
            verbose: false,
            status: InstallStatusTracker::new(0, false),
        })
    }

    /// Enable the interactive terminal status line.
    pub fn with_interactive_status(mut self) -> Self {
        self.status = InstallStatusTracker::new(0, true);
        self
    }

    pub fn installed(&self) -> &BTreeSet<String> {
        &self.installed
    }

    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.keys().cloned().collect()
    }

    /// Test hook: queue a task directly, bypassing request initialization.
    #[cfg(test)]
    pub(crate) fn inject_task(&mut self, task: Task) {
        self.queue.push(task);
    }

    /// Install every request and its dependencies, each exactly once.
    pub fn install(&mut self) -> Result<()> {
        let mut result = self.init_queue();
        if result.is_ok() {
            self.status.set_total(self.queue.len());
            result = self.run_loop();
        }

        self.cleanup_all_tasks();
        self.status.done();
        result?;
        self.report()
    }

    fn run_loop(&mut self) -> Result<()> {
        while let Some(mut task) = self.queue.pop() {
            let pkg_id = task.pkg_id().to_string();
            debug!(%pkg_id, attempts = task.attempts(), "processing task");

            // A popped task must have no uninstalled dependencies; anything
            // else is a scheduler bug and continuing would corrupt the run.
            if task.priority() != 0 {
                let deps = task
                    .uninstalled_deps()
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(",");
                error!(%pkg_id, %deps, "detected uninstalled dependencies at pop time");
                return Err(InstallError::Scheduler {
                    pkg_id,
                    count: task.priority(),
                    deps,
                }
                .into());
            }

            // Externally satisfied packages are flagged installed without a
            // lock or a build; some queued package likely depends on them.
            if task.pkg().external() || task.pkg().installed_upstream() {
                self.process_external(&task)?;
                self.update_installed(&task);
                continue;
            }

            // A package marked failed by this or another process prunes its
            // dependents immediately; no lock is needed since the failure
            // marker has its own lock file.
            if self.failed.contains_key(&pkg_id) || self.failure_tracker.has_failed(&pkg_id) {
                warn!(%pkg_id, "failed to install");
                self.update_failed(&task, false);
                if self.fail_fast {
                    return Err(InstallError::FailedDependency {
                        pkg_id,
                        reason: "marked as an install failure and fail_fast is set".to_string(),
                    }
                    .into());
                }
                continue;
            }

            task.mark_start();

            // Try a write lock without blocking; fall back to a read lock to
            // observe state established by whoever holds (or held) write.
            let mut held = LockKind::Write;
            let mut acquired = self.ensure_locked(LockKind::Write, &pkg_id)?;
            if !acquired {
                held = LockKind::Read;
                acquired = self.ensure_locked(LockKind::Read, &pkg_id)?;
            }
            if !acquired {
                // Another process is likely mid-install; check again later.
                self.requeue_task(task);
                continue;
            }

            if held == LockKind::Read {
                let (record, installed_in_db) = self.check_db(&pkg_id)?;
                if installed_in_db {
                    if task.explicit() {
                        if let Some(rec) = &record {
                            if !rec.explicit {
                                self.db.update_explicit(&pkg_id, true)?;
                            }
                        }
                    }
                    self.update_installed(&task);
                } else {
                    // The other process may be about to (un)install it;
                    // release our read lock and re-check on a later pass.
                    self.release_lock(&pkg_id);
                    self.requeue_task(task);
                }
                continue;
            }

            // Exclusive write lock held from here on.
            self.prepare_for_install(&task)?;

            let action = if self.installed.contains(&pkg_id) {
                self.install_action(&task)?
            } else {
                InstallAction::Install
            };

            if action == InstallAction::None {
                // Already overwritten by another process after our overwrite
                // timestamp; keep a read lock so nobody uninstalls it while
                // its dependents build.
                self.ensure_locked(LockKind::Read, &pkg_id)?;
                self.update_installed(&task);
                continue;
            }
            if self.installed.contains(&pkg_id) && action == InstallAction::Install {
                // Flagged installed during preparation and nothing to
                // overwrite; downgrade and move on.
                self.ensure_locked(LockKind::Read, &pkg_id)?;
                continue;
            }

            let exec_result = {
                let mut ctx = ExecuteContext {
                    layout: &self.layout,
                    db: self.db,
                    cache: self.cache,
                    executor: self.executor,
                    status: &mut self.status,
                    verbose: &mut self.verbose,
                };
                if action == InstallAction::Overwrite {
                    task.request().refresh_overwrite_time();
                    OverwriteInstall::new(&self.layout, self.db).install(&mut task, &mut ctx)
                } else {
                    task.execute(&mut ctx)
                }
            };

            match exec_result {
                Ok(ExecuteResult::Success) => {
                    self.update_installed(&task);
                    // Downgrade to a read lock to preclude other processes
                    // from uninstalling the package until its dependents are
                    // through.
                    self.ensure_locked(LockKind::Read, &pkg_id)?;
                }
                Ok(ExecuteResult::Stopped) => {
                    // Stopping before a phase is an early return, not a
                    // failure: dependents become ready, but nothing is
                    // registered or reported as installed.
                    debug!(%pkg_id, "stopped early; not recording an install");
                    self.update_installed(&task);
                    self.ensure_locked(LockKind::Read, &pkg_id)?;
                }
                Ok(ExecuteResult::Failed) => {
                    error!(%pkg_id, "install check failed");
                    self.update_failed(&task, true);
                    if self.fail_fast {
                        return Err(anyhow!("fail_fast is set: aborting after {pkg_id} failed"));
                    }
                }
                Ok(ExecuteResult::MissingBuildSpec) => {
                    self.requeue_with_build_spec_task(task)?;
                }
                Err(err) => {
                    if matches!(
                        err.downcast_ref::<InstallError>(),
                        Some(InstallError::ChecksumMismatch { .. })
                    ) {
                        // Recoverable: fall back to a source build.
                        warn!(%pkg_id, "binary checksum mismatch; requeueing for a source build");
                        let mut retry = task.next_attempt(&self.installed);
                        retry.use_cache = false;
                        self.queue.push(retry);
                        continue;
                    }
                    error!(%pkg_id, %err, "failed to install");
                    self.update_failed(&task, true);
                    if self.fail_fast {
                        return Err(err.context(format!(
                            "fail_fast is set: aborting after {pkg_id} failed"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Initialize the task queue for every build request, and knit the
    /// global dependents map across requests so a shared dependency knows
    /// about every requesting tree.
    fn init_queue(&mut self) -> Result<()> {
        debug!("initializing the build queue");
        for request in self.requests.clone() {
            if !request.options().install_deps {
                self.check_deps_status(&request)?;
            } else {
                let db = self.db;
                let deps = request.traverse_dependencies(&|spec: &PackageSpec| {
                    db.get_record(&package_id(spec))
                        .ok()
                        .flatten()
                        .map(|rec| rec.installed)
                        .unwrap_or(false)
                });
                for dep in deps {
                    let dep_id = package_id(&dep);
                    // Clear stale failure markers unless a live process in
                    // this parallel build owns them.
                    self.failure_tracker.clear(&dep_id, false)?;
                    if !self.queue.contains(&dep_id) {
                        self.add_init_task(dep, &request, false)?;
                    }
                }
            }

            // The explicit root always gets a clean slate.
            self.failure_tracker.clear(request.pkg_id(), true)?;
            if !self.queue.contains(request.pkg_id()) {
                self.add_init_task(Arc::clone(request.pkg()), &request, true)?;
            }
        }

        // Propagate dependents discovered only via the global map onto tasks
        // that did not otherwise know about them.
        for (dep_id, dependents) in self.all_dependents.clone() {
            if let Some(task) = self.queue.get_mut(&dep_id) {
                for dependent in &dependents {
                    task.add_dependent(dependent);
                }
            }
        }
        Ok(())
    }

    fn add_init_task(
        &mut self,
        pkg: Arc<PackageSpec>,
        request: &Arc<BuildRequest>,
        explicit: bool,
    ) -> Result<()> {
        let kind = if pkg.build_spec().is_some() {
            TaskKind::Rewire
        } else {
            TaskKind::Build
        };
        let task = Task::new(
            kind,
            pkg,
            Arc::clone(request),
            explicit,
            BuildStatus::Queued,
            &self.installed,
        )?;
        for dep_id in task.dependencies().clone() {
            self.all_dependents
                .entry(dep_id)
                .or_default()
                .insert(task.pkg_id().to_string());
        }
        self.queue.push(task);
        Ok(())
    }

    /// Pre-verify dependency install status for a request that skips
    /// dependency installation: every dependency must be failure-free,
    /// readable (not write-locked elsewhere), and already satisfied.
    fn check_deps_status(&mut self, request: &Arc<BuildRequest>) -> Result<()> {
        let db = self.db;
        let deps = request.traverse_dependencies(&|spec: &PackageSpec| {
            db.get_record(&package_id(spec))
                .ok()
                .flatten()
                .map(|rec| rec.installed)
                .unwrap_or(false)
        });
        for dep in deps {
            let dep_id = package_id(&dep);
            if self.failure_tracker.has_failed(&dep_id) {
                return Err(InstallError::FailedDependency {
                    pkg_id: request.pkg_id().to_string(),
                    reason: format!("{dep_id} is marked as an install failure"),
                }
                .into());
            }
            if !self.ensure_locked_timeout(LockKind::Read, &dep_id, Some(READ_LOCK_TIMEOUT))? {
                return Err(InstallError::FailedDependency {
                    pkg_id: request.pkg_id().to_string(),
                    reason: format!("{dep_id} is write locked by another process"),
                }
                .into());
            }
            if dep.external() || dep.installed_upstream() {
                debug!(%dep_id, "flagging external/upstream dependency as installed");
                self.installed.insert(dep_id);
                continue;
            }
            let (_, installed_in_db) = self.check_db(&dep_id)?;
            if installed_in_db {
                debug!(%dep_id, "flagging dependency as installed per the database");
                self.installed.insert(dep_id);
            } else {
                return Err(InstallError::FailedDependency {
                    pkg_id: request.pkg_id().to_string(),
                    reason: format!("{dep_id} is not installed"),
                }
                .into());
            }
        }
        Ok(())
    }

    fn check_db(&self, pkg_id: &str) -> Result<(Option<InstallRecord>, bool)> {
        let record = self.db.get_record(pkg_id)?;
        let installed_in_db = record.as_ref().map(|rec| rec.installed).unwrap_or(false);
        Ok((record, installed_in_db))
    }

    /// Register an external or upstream-satisfied package without building.
    fn process_external(&mut self, task: &Task) -> Result<()> {
        let spec = task.pkg();
        let pkg_id = task.pkg_id();
        if spec.installed_upstream() {
            info!(%pkg_id, "installed in an upstream store; skipping local install");
            return Ok(());
        }
        let prefix = spec
            .external_path()
            .cloned()
            .ok_or_else(|| anyhow!("external package {pkg_id} has no external path"))?;
        match self.db.get_record(pkg_id)? {
            Some(rec) => {
                debug!(%pkg_id, "external already registered in the database");
                if task.explicit() && !rec.explicit {
                    self.db.update_explicit(pkg_id, true)?;
                }
            }
            None => {
                info!(%pkg_id, prefix = %prefix.display(), "registering external package");
                self.db.add(spec, &prefix, task.explicit())?;
            }
        }
        Ok(())
    }

    /// Check leftover installation state and prepare a new install attempt:
    /// guard against locally uninstallable packages, re-check the database,
    /// detect prefix collisions, and clean stale prefixes.
    fn prepare_for_install(&mut self, task: &Task) -> Result<()> {
        let pkg_id = task.pkg_id();
        self.ensure_install_ready(task)?;

        // Filesystem state was already settled for this id.
        if self.installed.contains(pkg_id) {
            return Ok(());
        }

        let (record, installed_in_db) = self.check_db(pkg_id)?;
        let prefix = self.layout.prefix_path(pkg_id);

        if self.db.is_occupied_install_prefix(pkg_id, &prefix)? {
            return Err(InstallError::PrefixCollision {
                prefix: prefix.display().to_string(),
            }
            .into());
        }

        let mut partial = false;
        if !installed_in_db && prefix.is_dir() {
            if task.request().options().keep_prefix {
                debug!(%pkg_id, "is partially installed");
                partial = true;
            } else {
                std::fs::remove_dir_all(&prefix).with_context(|| {
                    format!("failed to remove stale prefix {}", prefix.display())
                })?;
            }
        }

        if !partial && installed_in_db && prefix.is_dir() {
            self.update_installed(task);
            if task.explicit() {
                if let Some(rec) = record {
                    if !rec.explicit {
                        self.db.update_explicit(pkg_id, true)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// The package must be locally installable and already write locked.
    fn ensure_install_ready(&self, task: &Task) -> Result<()> {
        let pkg_id = task.pkg_id();
        if task.pkg().external() {
            return Err(InstallError::ExternalPackage {
                pkg_id: pkg_id.to_string(),
            }
            .into());
        }
        if task.pkg().installed_upstream() {
            return Err(InstallError::Upstream {
                pkg_id: pkg_id.to_string(),
            }
            .into());
        }
        match self.locks.get(pkg_id) {
            Some((_, Some(_))) => Ok(()),
            _ => Err(InstallError::LockFailure {
                pkg_id: pkg_id.to_string(),
            }
            .into()),
        }
    }

    /// Decide what to do with a package the database considers installed.
    fn install_action(&self, task: &Task) -> Result<InstallAction> {
        if !task.request().overwriting(task.pkg()) {
            return Ok(InstallAction::Install);
        }
        let (record, installed_in_db) = self.check_db(task.pkg_id())?;
        if !installed_in_db {
            return Ok(InstallAction::Install);
        }
        if !self.layout.prefix_path(task.pkg_id()).is_dir() {
            return Ok(InstallAction::Install);
        }
        if let (Some(rec), Some(decided_at)) = (&record, task.request().overwrite_time()) {
            if rec.installed_at_unix > decided_at {
                // Another process reinstalled it after we decided to
                // overwrite; nothing left to do.
                return Ok(InstallAction::None);
            }
        }
        Ok(InstallAction::Overwrite)
    }

    /// Add (or adjust) the store lock of the requested kind for a package.
    /// Returns whether a lock of that kind is now held; timeouts are
    /// reported as `false`, I/O failures clean up and propagate.
    fn ensure_locked(&mut self, kind: LockKind, pkg_id: &str) -> Result<bool> {
        let timeout = match kind {
            LockKind::Write => Some(WRITE_LOCK_TIMEOUT),
            LockKind::Read => {
                // Wait for the other process only when there is no other
                // ready work to fall back to.
                let no_ready = self.queue.is_empty() || !self.queue.next_is_priority_zero();
                if no_ready {
                    self.status.waiting_for(pkg_id);
                    None
                } else {
                    Some(READ_LOCK_TIMEOUT)
                }
            }
        };
        self.ensure_locked_timeout(kind, pkg_id, timeout)
    }

    fn ensure_locked_timeout(
        &mut self,
        kind: LockKind,
        pkg_id: &str,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        if let Some((held, Some(_))) = self.locks.get(pkg_id) {
            if *held == kind {
                return Ok(true);
            }
        }

        let outcome = match self.locks.remove(pkg_id) {
            Some((LockKind::Write, Some(mut lock))) => {
                debug!(%pkg_id, "downgrading to read lock");
                match lock.downgrade_write_to_read() {
                    Ok(()) => (LockKind::Read, Some(lock), true),
                    Err(err @ LockError::Io { .. }) => return self.lock_failure(err),
                    Err(err) => {
                        debug!(%pkg_id, %err, "failed to downgrade lock");
                        (LockKind::Write, Some(lock), false)
                    }
                }
            }
            Some((LockKind::Read, Some(mut lock))) => {
                debug!(%pkg_id, ?timeout, "upgrading to write lock");
                match lock.upgrade_read_to_write(timeout) {
                    Ok(()) => (LockKind::Write, Some(lock), true),
                    Err(err @ LockError::Timeout { .. }) => {
                        debug!(%pkg_id, %err, "failed to upgrade lock");
                        (LockKind::Read, Some(lock), false)
                    }
                    Err(err) => return self.lock_failure(err),
                }
            }
            _ => {
                debug!(%pkg_id, kind = kind.as_str(), ?timeout, "acquiring lock");
                let mut lock = match PrefixLock::new(pkg_id, self.layout.lock_path(pkg_id)) {
                    Ok(lock) => lock,
                    Err(err) => return self.lock_failure(err),
                };
                let acquired = match kind {
                    LockKind::Read => lock.acquire_read(timeout),
                    LockKind::Write => lock.acquire_write(timeout),
                };
                match acquired {
                    Ok(()) => (kind, Some(lock), true),
                    Err(err @ LockError::Timeout { .. }) => {
                        debug!(%pkg_id, %err, "failed to acquire lock");
                        (kind, None, false)
                    }
                    Err(err) => return self.lock_failure(err),
                }
            }
        };

        let (held, lock, acquired) = outcome;
        self.locks.insert(pkg_id.to_string(), (held, lock));
        Ok(acquired)
    }

    fn lock_failure(&mut self, err: LockError) -> Result<bool> {
        error!(%err, "unrecoverable lock failure");
        self.cleanup_all_tasks();
        Err(err.into())
    }

    fn release_lock(&mut self, pkg_id: &str) {
        if let Some((kind, lock)) = self.locks.remove(pkg_id) {
            if let Some(mut lock) = lock {
                debug!(%pkg_id, kind = kind.as_str(), "releasing lock");
                if let Err(err) = lock.release_all() {
                    warn!(%pkg_id, %err, "exception when releasing lock");
                }
            }
        }
    }

    /// Requeue a task that appears to be in progress by another process.
    fn requeue_task(&mut self, task: Task) {
        if task.status() != BuildStatus::Installing {
            info!(pkg_id = %task.pkg_id(), "install in progress by another process");
            self.status.waiting_for(task.pkg_id());
        }
        let mut next = task.next_attempt(&self.installed);
        next.status = BuildStatus::Installing;
        self.queue.push(next);
    }

    /// A rewire found its donor neither installed nor cached: inject a task
    /// that builds the donor, make it a dependency of the rewire, and requeue.
    fn requeue_with_build_spec_task(&mut self, task: Task) -> Result<()> {
        let donor = Arc::clone(
            task.pkg()
                .build_spec()
                .ok_or_else(|| anyhow!("rewire task for {} has no build spec", task.pkg_id()))?,
        );
        let donor_id = package_id(&donor);
        let request = Arc::clone(task.request());

        if !self.queue.contains(&donor_id) && !self.installed.contains(&donor_id) {
            // The donor subtree may itself have unbuilt dependencies.
            let db = self.db;
            let deps = donor.traverse_dependencies(|spec| {
                request.depflags_for(spec, &|s: &PackageSpec| {
                    db.get_record(&package_id(s))
                        .ok()
                        .flatten()
                        .map(|rec| rec.installed)
                        .unwrap_or(false)
                })
            });
            for dep in deps {
                let dep_id = package_id(&dep);
                if !self.queue.contains(&dep_id) && !self.installed.contains(&dep_id) {
                    self.add_init_task(dep, &request, false)?;
                }
            }
            self.add_init_task(Arc::clone(&donor), &request, false)?;
        }
        if let Some(donor_task) = self.queue.get_mut(&donor_id) {
            donor_task.add_dependent(task.pkg_id());
        }
        self.all_dependents
            .entry(donor_id.clone())
            .or_default()
            .insert(task.pkg_id().to_string());

        let mut next = task.next_attempt(&self.installed);
        next.add_dependency(&donor_id, self.installed.contains(&donor_id));
        debug!(pkg_id = %next.pkg_id(), %donor_id, "requeued behind donor build spec");
        self.queue.push(next);
        Ok(())
    }

    /// Flag the task's package installed and requeue every dependent at its
    /// new (lower) priority.
    fn update_installed(&mut self, task: &Task) {
        let pkg_id = task.pkg_id();
        if !self.installed.insert(pkg_id.to_string()) {
            return;
        }
        debug!(%pkg_id, "flagging as installed");
        for dep_id in task.dependents().clone() {
            if let Some(dep_task) = self.queue.remove(&dep_id) {
                let fresh = dep_task.next_attempt(&self.installed);
                self.queue.push(fresh);
            } else {
                debug!(%dep_id, "no task to update for this install");
            }
        }
    }

    /// Record a failure exactly once and transitively prune every dependent
    /// task still in the queue.
    fn update_failed(&mut self, task: &Task, mark: bool) {
        let pkg_id = task.pkg_id().to_string();
        debug!(%pkg_id, "flagging as failed");
        if !self.failed.contains_key(&pkg_id) {
            let handle = if mark {
                match self.failure_tracker.mark(&pkg_id) {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        warn!(%pkg_id, %err, "unable to persist failure marker");
                        None
                    }
                }
            } else {
                None
            };
            self.failed.insert(pkg_id.clone(), handle);
        }
        for dep_id in task.dependents().clone() {
            if let Some(dep_task) = self.queue.remove(&dep_id) {
                warn!(%dep_id, %pkg_id, "skipping build since its dependency failed");
                self.update_failed(&dep_task, mark);
            } else {
                debug!(%dep_id, "no task to skip for this failure");
            }
        }
    }

    /// Release every lock and the failure-marker locks this process owns.
    /// The marker files themselves persist so later runs detect the failure.
    fn cleanup_all_tasks(&mut self) {
        let ids: Vec<String> = self.locks.keys().cloned().collect();
        for pkg_id in ids {
            self.release_lock(&pkg_id);
        }
        for (pkg_id, handle) in std::mem::take(&mut self.failed) {
            self.failed.insert(pkg_id, None);
            if let Some(mark) = handle {
                mark.release();
            }
        }
        for pkg_id in self.queue.ids() {
            self.queue.remove(&pkg_id);
        }
    }

    /// Raise one aggregate error if any explicit request is missing from the
    /// installed set or recorded a failure; per-package errors were already
    /// reported as they occurred.
    fn report(&self) -> Result<()> {
        let mut failed: Vec<String> = self
            .requests
            .iter()
            .filter(|request| {
                !self.installed.contains(request.pkg_id())
                    || self.failed.contains_key(request.pkg_id())
            })
            .map(|request| request.pkg_id().to_string())
            .collect();
        if failed.is_empty() {
            return Ok(());
        }
        failed.sort();
        Err(InstallError::Aggregate {
            failed: failed.join(", "),
        }
        .into())
    }
}
