use std::collections::BTreeSet;
use std::fs;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use semver::Version;
use tempfile::TempDir;

use forgepack_core::{package_id, DepFlag, PackageSpec, SpecBuilder};

use crate::queue::TaskQueue;

use super::*;

struct Store {
    _tmp: TempDir,
    layout: StoreLayout,
    db: FsDatabase,
}

fn store() -> Store {
    let tmp = tempfile::tempdir().expect("tempdir");
    let layout = StoreLayout::new(tmp.path());
    layout.ensure_base_dirs().expect("base dirs");
    let db = FsDatabase::new(layout.clone());
    Store {
        _tmp: tmp,
        layout,
        db,
    }
}

fn pkg(name: &str) -> Arc<PackageSpec> {
    SpecBuilder::new(name)
        .version(Version::new(1, 2, 3))
        .build()
        .expect("concrete spec")
}

fn pkg_with_deps(name: &str, deps: &[&Arc<PackageSpec>]) -> Arc<PackageSpec> {
    let mut builder = SpecBuilder::new(name).version(Version::new(1, 2, 3));
    for dep in deps {
        builder = builder.depends_on(Arc::clone(dep), DepFlag::LINK);
    }
    builder.build().expect("concrete spec")
}

/// `a -> (b, c) -> d`. Returns the root and `[a, b, c, d]` ids.
fn diamond() -> (Arc<PackageSpec>, [String; 4]) {
    let d = pkg("d");
    let b = pkg_with_deps("b", &[&d]);
    let c = pkg_with_deps("c", &[&d]);
    let a = pkg_with_deps("a", &[&b, &c]);
    let ids = [
        package_id(&a),
        package_id(&b),
        package_id(&c),
        package_id(&d),
    ];
    (a, ids)
}

/// Executor that records build order and writes a payload file, with
/// optional per-name failure and stop-before-phase behavior.
#[derive(Default)]
struct Recorder {
    built: Mutex<Vec<String>>,
    fail: BTreeSet<String>,
    stop: BTreeSet<String>,
}

impl Recorder {
    fn new() -> Self {
        Self::default()
    }

    fn failing(names: &[&str]) -> Self {
        Self {
            fail: names.iter().map(|name| name.to_string()).collect(),
            ..Self::default()
        }
    }

    fn stopping(names: &[&str]) -> Self {
        Self {
            stop: names.iter().map(|name| name.to_string()).collect(),
            ..Self::default()
        }
    }

    fn built_ids(&self) -> Vec<String> {
        self.built.lock().expect("recorder mutex").clone()
    }
}

impl BuildExecutor for Recorder {
    fn build(&self, spec: &PackageSpec, ctx: BuildContext<'_>) -> Result<BuildOutcome> {
        if self.fail.contains(spec.name()) {
            bail!("synthetic build failure for {}", spec.name());
        }
        if self.stop.contains(spec.name()) {
            return Ok(BuildOutcome::Stopped);
        }
        fs::write(ctx.prefix.join("payload"), spec.name())?;
        self.built
            .lock()
            .expect("recorder mutex")
            .push(package_id(spec));
        Ok(BuildOutcome::Built {
            verbose: ctx.verbose,
        })
    }
}

fn install_with_cache(
    store: &Store,
    exec: &dyn BuildExecutor,
    cache: Option<&dyn BinaryCache>,
    pkgs: Vec<(Arc<PackageSpec>, InstallOptions)>,
) -> Result<()> {
    let mut installer = PackageInstaller::new(store.layout.clone(), &store.db, cache, exec, pkgs)?;
    installer.install()
}

fn install_all(
    store: &Store,
    exec: &dyn BuildExecutor,
    pkgs: Vec<(Arc<PackageSpec>, InstallOptions)>,
) -> Result<()> {
    install_with_cache(store, exec, None, pkgs)
}

fn preinstall(store: &Store, spec: &Arc<PackageSpec>, content: &str) {
    let pkg_id = package_id(spec);
    let prefix = store.layout.prefix_path(&pkg_id);
    fs::create_dir_all(&prefix).expect("create prefix");
    fs::write(prefix.join("payload"), content).expect("write payload");
    store.db.add(spec, &prefix, false).expect("db add");
}

#[test]
fn diamond_installs_bottom_up_exactly_once() {
    let s = store();
    let (a, ids) = diamond();
    let exec = Recorder::new();

    install_all(&s, &exec, vec![(Arc::clone(&a), InstallOptions::default())])
        .expect("install diamond");

    let built = exec.built_ids();
    assert_eq!(built.len(), 4, "each package builds exactly once");
    assert_eq!(built[0], ids[3], "the shared leaf builds first");
    assert_eq!(built[3], ids[0], "the root builds last");
    for pkg_id in &ids {
        let record = s.db.get_record(pkg_id).expect("db read").expect("record");
        assert!(record.installed);
        assert!(s.layout.prefix_path(pkg_id).join("payload").is_file());
    }
    let root = s.db.get_record(&ids[0]).expect("db read").expect("record");
    assert!(root.explicit, "the requested root is explicit");
    let leaf = s.db.get_record(&ids[3]).expect("db read").expect("record");
    assert!(!leaf.explicit);
}

#[test]
fn dependency_failure_prunes_all_dependents() {
    let s = store();
    let (a, ids) = diamond();
    let exec = Recorder::failing(&["d"]);

    let err = install_all(&s, &exec, vec![(Arc::clone(&a), InstallOptions::default())])
        .expect_err("root cannot install");
    assert!(err.to_string().contains(&ids[0]));

    assert!(exec.built_ids().is_empty(), "no dependent may build");
    for pkg_id in &ids {
        assert!(s.db.get_record(pkg_id).expect("db read").is_none());
    }
    // The leaf and every pruned dependent leave markers for other processes.
    for pkg_id in &ids {
        assert!(
            s.layout.failure_mark_path(pkg_id).is_file(),
            "{pkg_id} should carry a failure marker"
        );
    }
}

#[test]
fn live_failure_mark_blocks_dependents_without_building() {
    let s = store();
    let (a, ids) = diamond();
    let tracker = FailureTracker::new(s.layout.clone());
    // Another live installer saw the leaf fail; its mark stays locked.
    let mark = tracker.mark(&ids[3]).expect("mark leaf failed");

    let exec = Recorder::new();
    let err = install_all(&s, &exec, vec![(Arc::clone(&a), InstallOptions::default())])
        .expect_err("root cannot install");
    assert!(err.to_string().contains(&ids[0]));
    assert!(exec.built_ids().is_empty());

    mark.release();
}

#[test]
fn popping_a_blocked_task_is_a_fatal_scheduler_error() {
    let s = store();
    let d = pkg("d");
    let b = pkg_with_deps("b", &[&d]);
    let exec = Recorder::new();
    let mut installer = PackageInstaller::new(s.layout.clone(), &s.db, None, &exec, Vec::new())
        .expect("installer");
    // A task whose dependency never got a queue entry: it pops with a
    // nonzero priority, which must abort rather than build out of order.
    installer.inject_task(task_for(&b, &BTreeSet::new()));

    let err = installer.install().expect_err("scheduler invariant violated");
    assert!(matches!(
        err.downcast_ref::<InstallError>(),
        Some(InstallError::Scheduler { .. })
    ));
    assert!(err.to_string().contains("uninstalled dependency"));
    assert!(exec.built_ids().is_empty(), "nothing may build");
}

#[test]
fn fail_fast_aborts_the_whole_run() {
    let s = store();
    let x = pkg("x");
    let y = pkg("y");
    let exec = Recorder::failing(&["x"]);
    let options = InstallOptions {
        fail_fast: true,
        ..InstallOptions::default()
    };

    install_all(
        &s,
        &exec,
        vec![
            (Arc::clone(&x), options.clone()),
            (Arc::clone(&y), options),
        ],
    )
    .expect_err("first failure aborts");

    assert!(exec.built_ids().is_empty());
    assert!(s.db.get_record(&package_id(&y)).expect("db read").is_none());
}

#[test]
fn best_effort_run_installs_unrelated_requests() {
    let s = store();
    let x = pkg("x");
    let y = pkg("y");
    let exec = Recorder::failing(&["x"]);

    let err = install_all(
        &s,
        &exec,
        vec![
            (Arc::clone(&x), InstallOptions::default()),
            (Arc::clone(&y), InstallOptions::default()),
        ],
    )
    .expect_err("one request failed");

    let message = err.to_string();
    assert!(message.contains(&package_id(&x)));
    assert!(!message.contains(&package_id(&y)));
    let record = s
        .db
        .get_record(&package_id(&y))
        .expect("db read")
        .expect("y installed despite x failing");
    assert!(record.installed);
}

#[test]
fn binary_cache_hit_skips_the_build() {
    let s = store();
    let a = pkg("a");
    let cache = DirCache::new(s.layout.clone());

    let staged = tempfile::tempdir().expect("tempdir");
    fs::write(staged.path().join("payload"), "from-cache").expect("stage payload");
    cache.insert(&a, staged.path()).expect("publish binary");

    let exec = Recorder::new();
    install_with_cache(
        &s,
        &exec,
        Some(&cache),
        vec![(Arc::clone(&a), InstallOptions::default())],
    )
    .expect("install from cache");

    assert!(exec.built_ids().is_empty(), "no source build happened");
    let pkg_id = package_id(&a);
    let payload = fs::read_to_string(s.layout.prefix_path(&pkg_id).join("payload"))
        .expect("read payload");
    assert_eq!(payload, "from-cache");
    assert!(s.db.get_record(&pkg_id).expect("db read").is_some());
}

#[test]
fn checksum_mismatch_falls_back_to_source_build() {
    let s = store();
    let a = pkg("a");
    let pkg_id = package_id(&a);
    let cache = DirCache::new(s.layout.clone());

    let staged = tempfile::tempdir().expect("tempdir");
    fs::write(staged.path().join("payload"), "from-cache").expect("stage payload");
    cache.insert(&a, staged.path()).expect("publish binary");
    fs::write(cache.digest_manifest_path(&pkg_id), "deadbeef").expect("tamper digest");

    let exec = Recorder::new();
    install_with_cache(
        &s,
        &exec,
        Some(&cache),
        vec![(Arc::clone(&a), InstallOptions::default())],
    )
    .expect("recoverable: built from source instead");

    assert_eq!(exec.built_ids(), vec![pkg_id.clone()]);
    let payload = fs::read_to_string(s.layout.prefix_path(&pkg_id).join("payload"))
        .expect("read payload");
    assert_eq!(payload, "a", "the source build won");
}

#[test]
fn cache_only_without_a_binary_fails() {
    let s = store();
    let a = pkg("a");
    let pkg_id = package_id(&a);
    let exec = Recorder::new();
    let options = InstallOptions {
        package_cache_only: true,
        ..InstallOptions::default()
    };

    let err = install_all(&s, &exec, vec![(Arc::clone(&a), options)])
        .expect_err("no binary available");
    assert!(err.to_string().contains(&pkg_id));
    assert!(exec.built_ids().is_empty());
    assert!(s.db.get_record(&pkg_id).expect("db read").is_none());
    assert!(s.layout.failure_mark_path(&pkg_id).is_file());
}

#[test]
fn external_dependency_is_registered_not_built() {
    let s = store();
    let sysz = SpecBuilder::new("sysz")
        .version(Version::new(0, 9, 0))
        .external("/opt/sysz")
        .build()
        .expect("external spec");
    let a = pkg_with_deps("a", &[&sysz]);

    let exec = Recorder::new();
    install_all(&s, &exec, vec![(Arc::clone(&a), InstallOptions::default())])
        .expect("install with external dep");

    assert_eq!(exec.built_ids(), vec![package_id(&a)]);
    let record = s
        .db
        .get_record(&package_id(&sysz))
        .expect("db read")
        .expect("external registered");
    assert_eq!(record.prefix, "/opt/sysz");
    assert!(!record.explicit);
}

#[test]
fn upstream_dependency_is_skipped_entirely() {
    let s = store();
    let libup = SpecBuilder::new("libup")
        .version(Version::new(2, 0, 0))
        .installed_upstream()
        .build()
        .expect("upstream spec");
    let a = pkg_with_deps("a", &[&libup]);

    let exec = Recorder::new();
    install_all(&s, &exec, vec![(Arc::clone(&a), InstallOptions::default())])
        .expect("install with upstream dep");

    assert_eq!(exec.built_ids(), vec![package_id(&a)]);
    // The upstream store owns that record; the local db stays silent.
    assert!(s
        .db
        .get_record(&package_id(&libup))
        .expect("db read")
        .is_none());
}

#[test]
fn stopped_build_unblocks_dependents_without_a_record() {
    let s = store();
    let (a, ids) = diamond();
    let exec = Recorder::stopping(&["d"]);

    install_all(&s, &exec, vec![(Arc::clone(&a), InstallOptions::default())])
        .expect("stop is not a failure");

    let built = exec.built_ids();
    assert_eq!(built.len(), 3, "b, c and a still build");
    assert_eq!(built[2], ids[0]);
    assert!(
        s.db.get_record(&ids[3]).expect("db read").is_none(),
        "a stopped build is never registered"
    );
    assert!(s.db.get_record(&ids[0]).expect("db read").is_some());
}

#[test]
fn already_installed_root_is_not_rebuilt() {
    let s = store();
    let a = pkg("a");
    preinstall(&s, &a, "v1");

    let exec = Recorder::new();
    install_all(&s, &exec, vec![(Arc::clone(&a), InstallOptions::default())])
        .expect("nothing to do");

    assert!(exec.built_ids().is_empty());
    let record = s
        .db
        .get_record(&package_id(&a))
        .expect("db read")
        .expect("record");
    assert!(record.explicit, "an explicit request upgrades the marking");
}

#[test]
fn skipping_dependency_install_requires_installed_deps() {
    let s = store();
    let b = pkg("b");
    let a = pkg_with_deps("a", &[&b]);
    let options = InstallOptions {
        install_deps: false,
        ..InstallOptions::default()
    };

    let exec = Recorder::new();
    let err = install_all(&s, &exec, vec![(Arc::clone(&a), options.clone())])
        .expect_err("b is not installed");
    assert!(err.to_string().contains("is not installed"));

    preinstall(&s, &b, "b");
    install_all(&s, &exec, vec![(Arc::clone(&a), options)]).expect("deps satisfied");
    assert_eq!(exec.built_ids(), vec![package_id(&a)]);
}

#[test]
fn rewire_injects_a_donor_build_when_missing() {
    let s = store();
    let donor = pkg("lib");
    let spliced = SpecBuilder::new("lib")
        .version(Version::new(1, 2, 3))
        .build_spec(Arc::clone(&donor))
        .build()
        .expect("spliced spec");
    assert_ne!(package_id(&donor), package_id(&spliced));

    let exec = Recorder::new();
    install_all(
        &s,
        &exec,
        vec![(Arc::clone(&spliced), InstallOptions::default())],
    )
    .expect("rewire after donor build");

    assert_eq!(exec.built_ids(), vec![package_id(&donor)]);
    let payload = fs::read_to_string(
        s.layout
            .prefix_path(&package_id(&spliced))
            .join("payload"),
    )
    .expect("read payload");
    assert_eq!(payload, "lib", "the donor payload was rewired in");
    assert!(s
        .db
        .get_record(&package_id(&spliced))
        .expect("db read")
        .is_some());
    assert!(s
        .db
        .get_record(&package_id(&donor))
        .expect("db read")
        .is_some());
}

#[test]
fn rewire_reuses_an_installed_donor() {
    let s = store();
    let donor = pkg("lib");
    preinstall(&s, &donor, "donor-payload");
    let spliced = SpecBuilder::new("lib")
        .version(Version::new(1, 2, 3))
        .build_spec(Arc::clone(&donor))
        .build()
        .expect("spliced spec");

    let exec = Recorder::new();
    install_all(
        &s,
        &exec,
        vec![(Arc::clone(&spliced), InstallOptions::default())],
    )
    .expect("rewire against installed donor");

    assert!(exec.built_ids().is_empty(), "no build needed");
    let payload = fs::read_to_string(
        s.layout
            .prefix_path(&package_id(&spliced))
            .join("payload"),
    )
    .expect("read payload");
    assert_eq!(payload, "donor-payload");
}

#[test]
fn overwrite_reinstalls_in_place() {
    let s = store();
    let a = pkg("a");
    let pkg_id = package_id(&a);
    preinstall(&s, &a, "v1");

    let exec = |_: &PackageSpec, ctx: BuildContext<'_>| -> Result<BuildOutcome> {
        fs::write(ctx.prefix.join("payload"), "v2")?;
        Ok(BuildOutcome::Built { verbose: false })
    };
    let options = InstallOptions {
        overwrite: [a.dag_hash().to_string()].into_iter().collect(),
        ..InstallOptions::default()
    };

    install_all(&s, &exec, vec![(Arc::clone(&a), options)]).expect("overwrite");

    let payload = fs::read_to_string(s.layout.prefix_path(&pkg_id).join("payload"))
        .expect("read payload");
    assert_eq!(payload, "v2");
    assert!(
        !s.layout.backup_path(&pkg_id).exists(),
        "the backup is discarded after success"
    );
}

#[test]
fn failed_overwrite_restores_the_previous_install() {
    let s = store();
    let a = pkg("a");
    let pkg_id = package_id(&a);
    preinstall(&s, &a, "v1");

    let exec = Recorder::failing(&["a"]);
    let options = InstallOptions {
        overwrite: [a.dag_hash().to_string()].into_iter().collect(),
        ..InstallOptions::default()
    };

    install_all(&s, &exec, vec![(Arc::clone(&a), options)])
        .expect_err("the overwrite build failed");

    let payload = fs::read_to_string(s.layout.prefix_path(&pkg_id).join("payload"))
        .expect("read payload");
    assert_eq!(payload, "v1", "the backup came back");
    assert!(
        s.db.get_record(&pkg_id).expect("db read").is_some(),
        "the previous record still describes a real prefix"
    );
}

#[test]
fn waits_for_a_lock_held_by_another_process() {
    let s = store();
    let a = pkg("a");
    let pkg_id = package_id(&a);
    let lock_path = s.layout.lock_path(&pkg_id);

    let holder_id = pkg_id.clone();
    let (ready_tx, ready_rx) = mpsc::channel();
    let holder = thread::spawn(move || {
        let mut lock = PrefixLock::new(holder_id, lock_path).expect("holder lock");
        lock.acquire_write(None).expect("holder write");
        ready_tx.send(()).expect("signal ready");
        thread::sleep(Duration::from_millis(400));
        lock.release_all().expect("holder release");
    });
    ready_rx.recv().expect("holder ready");

    let exec = Recorder::new();
    install_all(&s, &exec, vec![(Arc::clone(&a), InstallOptions::default())])
        .expect("installed once the holder released");
    holder.join().expect("holder thread");

    assert_eq!(exec.built_ids(), vec![pkg_id.clone()]);
    assert!(s.db.get_record(&pkg_id).expect("db read").is_some());
}

#[test]
fn queue_replaces_tasks_by_lazy_deletion() {
    let mut queue = TaskQueue::new();
    let x = pkg("x");
    let none = BTreeSet::new();
    let first = task_for(&x, &none);
    let first_seq = first.sequence();
    queue.push(first);
    let replacement = task_for(&x, &none);
    let replacement_seq = replacement.sequence();
    queue.push(replacement);

    assert_eq!(queue.len(), 1);
    let popped = queue.pop().expect("live task");
    assert_eq!(popped.sequence(), replacement_seq);
    assert!(popped.sequence() > first_seq);
    assert_eq!(popped.status(), BuildStatus::Dequeued);
    assert!(queue.pop().is_none(), "the stale entry evaporated");
}

#[test]
fn queue_pops_ready_tasks_before_blocked_ones() {
    let mut queue = TaskQueue::new();
    let none = BTreeSet::new();
    let d = pkg("d");
    let b = pkg_with_deps("b", &[&d]);
    queue.push(task_for(&b, &none)); // queued first, but blocked on d
    queue.push(task_for(&d, &none));

    assert!(queue.next_is_priority_zero());
    let popped = queue.pop().expect("live task");
    assert_eq!(popped.pkg_id(), package_id(&d));
    assert!(!queue.next_is_priority_zero(), "only the blocked task is left");
}

#[test]
fn next_attempt_prunes_and_renumbers() {
    let none = BTreeSet::new();
    let d = pkg("d");
    let b = pkg_with_deps("b", &[&d]);
    let task = task_for(&b, &none);
    assert_eq!(task.priority(), 1);
    assert_eq!(task.attempts(), 1);

    let mut installed = BTreeSet::new();
    installed.insert(package_id(&d));
    let next = task.next_attempt(&installed);
    assert_eq!(next.attempts(), 2);
    assert!(next.sequence() > task.sequence());
    assert_eq!(next.priority(), 0);
    assert_eq!(next.status(), BuildStatus::Queued);
    // The original is untouched.
    assert_eq!(task.priority(), 1);
}

fn task_for(spec: &Arc<PackageSpec>, installed: &BTreeSet<String>) -> Task {
    let request = Arc::new(
        BuildRequest::new(Arc::clone(spec), InstallOptions::default(), |_| false)
            .expect("request"),
    );
    Task::new(
        TaskKind::Build,
        Arc::clone(spec),
        request,
        true,
        BuildStatus::Queued,
        installed,
    )
    .expect("task")
}

#[test]
fn write_lock_excludes_other_handles() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("x.lock");
    let mut one = PrefixLock::new("x", &path).expect("lock");
    one.acquire_write(Some(Duration::ZERO)).expect("write");

    let mut two = PrefixLock::new("x", &path).expect("lock");
    assert!(matches!(
        two.acquire_write(Some(Duration::from_millis(50))),
        Err(LockError::Timeout { .. })
    ));
    assert!(matches!(
        two.acquire_read(Some(Duration::from_millis(50))),
        Err(LockError::Timeout { .. })
    ));

    one.release_write().expect("release");
    two.acquire_read(Some(Duration::ZERO)).expect("read after release");
}

#[test]
fn dropping_a_lock_handle_releases_the_file() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("x.lock");
    let mut one = PrefixLock::new("x", &path).expect("lock");
    one.acquire_write(Some(Duration::ZERO)).expect("write");
    drop(one);

    let mut two = PrefixLock::new("x", &path).expect("lock");
    two.acquire_write(Some(Duration::ZERO))
        .expect("write after the holder dropped");
}

#[test]
fn read_lock_upgrade_times_out_and_keeps_the_shared_grant() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("x.lock");
    let mut one = PrefixLock::new("x", &path).expect("lock");
    let mut two = PrefixLock::new("x", &path).expect("lock");
    one.acquire_read(Some(Duration::ZERO)).expect("read");
    two.acquire_read(Some(Duration::ZERO)).expect("shared read");

    assert!(matches!(
        one.upgrade_read_to_write(Some(Duration::from_millis(50))),
        Err(LockError::Timeout { .. })
    ));
    assert!(one.is_read_locked(), "the shared grant survived the timeout");

    two.release_read().expect("release other reader");
    one.upgrade_read_to_write(Some(Duration::from_millis(50)))
        .expect("upgrade once exclusive");
    one.downgrade_write_to_read().expect("downgrade");
    two.acquire_read(Some(Duration::ZERO))
        .expect("shared again after downgrade");
}

#[test]
fn failure_marks_are_cleared_only_when_stale() {
    let s = store();
    let tracker = FailureTracker::new(s.layout.clone());
    let pkg_id = "pkg-1.0.0-abc123";

    let mark = tracker.mark(pkg_id).expect("mark failed");
    assert!(tracker.has_failed(pkg_id));

    // Held by a live process: a non-forced clear leaves it.
    tracker.clear(pkg_id, false).expect("clear attempt");
    assert!(tracker.has_failed(pkg_id));

    // Released but persisted: stale, so a non-forced clear removes it.
    mark.release();
    assert!(tracker.has_failed(pkg_id));
    tracker.clear(pkg_id, false).expect("clear stale");
    assert!(!tracker.has_failed(pkg_id));

    // Force clears even a live mark.
    let mark = tracker.mark(pkg_id).expect("mark again");
    tracker.clear(pkg_id, true).expect("force clear");
    assert!(!tracker.has_failed(pkg_id));
    mark.release();
}

#[test]
fn database_rejects_foreign_prefix_claims() {
    let s = store();
    let a = pkg("a");
    let b = pkg("b");
    let prefix = s.layout.prefix_path(&package_id(&a));
    s.db.add(&a, &prefix, false).expect("db add");

    assert!(!s
        .db
        .is_occupied_install_prefix(&package_id(&a), &prefix)
        .expect("occupancy check"));
    assert!(s
        .db
        .is_occupied_install_prefix(&package_id(&b), &prefix)
        .expect("occupancy check"));

    s.db.update_explicit(&package_id(&a), true).expect("update");
    let record = s
        .db
        .get_record(&package_id(&a))
        .expect("db read")
        .expect("record");
    assert!(record.explicit);
}
