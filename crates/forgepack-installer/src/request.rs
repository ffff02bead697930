use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use forgepack_core::{package_id, DepFlag, PackageSpec};

/// Which packages get their test suites run during install.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TestsPolicy {
    #[default]
    None,
    All,
    Named(BTreeSet<String>),
}

impl TestsPolicy {
    pub fn requested_for(&self, name: &str) -> bool {
        match self {
            TestsPolicy::None => false,
            TestsPolicy::All => true,
            TestsPolicy::Named(names) => names.contains(name),
        }
    }
}

/// Normalized install options for one build request. Constructing via
/// `Default` fills the recognized defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub install_deps: bool,
    pub include_build_deps: bool,
    pub package_use_cache: bool,
    pub package_cache_only: bool,
    pub dependencies_use_cache: bool,
    pub dependencies_cache_only: bool,
    pub tests: TestsPolicy,
    /// `None` means "verify signatures/checksums" (the signed default).
    pub unsigned: Option<bool>,
    pub fail_fast: bool,
    pub keep_prefix: bool,
    pub verbose: bool,
    /// Dag hashes of packages to overwrite in place.
    pub overwrite: BTreeSet<String>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            install_deps: true,
            include_build_deps: false,
            package_use_cache: true,
            package_cache_only: false,
            dependencies_use_cache: true,
            dependencies_cache_only: false,
            tests: TestsPolicy::None,
            unsigned: None,
            fail_fast: false,
            keep_prefix: false,
            verbose: false,
            overwrite: BTreeSet::new(),
        }
    }
}

impl InstallOptions {
    pub fn verify_signatures(&self) -> bool {
        !self.unsigned.unwrap_or(false)
    }
}

/// One explicitly requested top-level install: the root spec, its normalized
/// options, and the direct dependency ids the request's depflag policy
/// selects. Immutable once constructed except for the overwrite timestamp,
/// which is refreshed right before an overwrite install begins.
#[derive(Debug)]
pub struct BuildRequest {
    pkg: Arc<PackageSpec>,
    pkg_id: String,
    options: InstallOptions,
    dependencies: BTreeSet<String>,
    overwrite_time: AtomicU64,
}

impl BuildRequest {
    pub fn new<F>(
        pkg: Arc<PackageSpec>,
        options: InstallOptions,
        is_installed: F,
    ) -> Result<Self>
    where
        F: Fn(&PackageSpec) -> bool,
    {
        if !pkg.is_concrete() {
            return Err(anyhow!(
                "can only install concrete packages: '{}' is abstract",
                pkg.name()
            ));
        }
        let pkg_id = package_id(&pkg);
        let mut request = Self {
            pkg,
            pkg_id,
            options,
            dependencies: BTreeSet::new(),
            overwrite_time: AtomicU64::new(0),
        };
        request.dependencies = request
            .pkg
            .dependencies(request.depflags_for(&request.pkg, &is_installed))
            .iter()
            .map(|dep| package_id(dep))
            .filter(|dep_id| *dep_id != request.pkg_id)
            .collect();
        if !request.options.overwrite.is_empty() {
            request.refresh_overwrite_time();
        }
        Ok(request)
    }

    pub fn pkg(&self) -> &Arc<PackageSpec> {
        &self.pkg
    }

    pub fn pkg_id(&self) -> &str {
        &self.pkg_id
    }

    pub fn options(&self) -> &InstallOptions {
        &self.options
    }

    /// Direct dependency ids of the root, excluding the root itself.
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    fn is_root(&self, spec: &PackageSpec) -> bool {
        package_id(spec) == self.pkg_id
    }

    pub fn use_cache_for(&self, spec: &PackageSpec) -> bool {
        if self.is_root(spec) {
            self.options.package_use_cache
        } else {
            self.options.dependencies_use_cache
        }
    }

    pub fn cache_only_for(&self, spec: &PackageSpec) -> bool {
        if self.is_root(spec) {
            self.options.package_cache_only
        } else {
            self.options.dependencies_cache_only
        }
    }

    pub fn overwriting(&self, spec: &PackageSpec) -> bool {
        self.options.overwrite.contains(spec.dag_hash())
    }

    /// Unix time of the last overwrite-timestamp refresh, if any.
    pub fn overwrite_time(&self) -> Option<u64> {
        match self.overwrite_time.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }

    /// Refresh the overwrite timestamp; called right before an overwrite
    /// install begins so "already overwritten by another process" checks
    /// compare against the latest decision point.
    pub fn refresh_overwrite_time(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.overwrite_time.store(now.max(1), Ordering::Relaxed);
    }

    /// Dependency-type flags to honor for a given node of this request's
    /// graph. Link and run dependencies always count; build dependencies are
    /// skipped only for cache-only packages that are already installed and
    /// not being overwritten; test dependencies count iff tests were
    /// requested for that package.
    pub fn depflags_for<F>(&self, spec: &PackageSpec, is_installed: &F) -> DepFlag
    where
        F: Fn(&PackageSpec) -> bool,
    {
        let mut depflag = DepFlag::LINK | DepFlag::RUN;
        let skip_build = self.cache_only_for(spec)
            && is_installed(spec)
            && !self.overwriting(spec);
        if self.options.include_build_deps || !skip_build {
            depflag |= DepFlag::BUILD;
        }
        if self.options.tests.requested_for(spec.name()) {
            depflag |= DepFlag::TEST;
        }
        depflag
    }

    /// Deduplicated post-order walk of the request's dependencies, honoring
    /// the per-node depflag policy. The depflag is not constant across the
    /// graph, so a uniform-deptype traversal would be wrong here.
    pub fn traverse_dependencies<F>(&self, is_installed: &F) -> Vec<Arc<PackageSpec>>
    where
        F: Fn(&PackageSpec) -> bool,
    {
        self.pkg
            .traverse_dependencies(|spec| self.depflags_for(spec, is_installed))
    }
}
