use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use semver::Version;
use sha2::{Digest, Sha256};

use crate::depflag::DepFlag;

/// One edge in the dependency DAG.
#[derive(Debug, Clone)]
pub struct DepEdge {
    pub spec: Arc<PackageSpec>,
    pub depflag: DepFlag,
}

/// A concrete node in the package DAG.
///
/// Two builds of the "same" package share a spec when their name, version
/// and dependency subtree hash identically; `package_id` derived from those
/// three is the primary key for every scheduler map, lock file and database
/// record.
#[derive(Debug, Clone)]
pub struct PackageSpec {
    name: String,
    version: Version,
    dag_hash: String,
    external_path: Option<PathBuf>,
    installed_upstream: bool,
    dependencies: Vec<DepEdge>,
    build_spec: Option<Arc<PackageSpec>>,
}

impl PackageSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Content-addressed hash over the name, version and dependency subtree.
    /// Empty for abstract specs.
    pub fn dag_hash(&self) -> &str {
        &self.dag_hash
    }

    pub fn is_concrete(&self) -> bool {
        !self.dag_hash.is_empty()
    }

    /// An external package is satisfied by software outside the store; it is
    /// registered in the database but never built.
    pub fn external(&self) -> bool {
        self.external_path.is_some()
    }

    pub fn external_path(&self) -> Option<&PathBuf> {
        self.external_path.as_ref()
    }

    /// Installed in an upstream store shared read-only with this one.
    pub fn installed_upstream(&self) -> bool {
        self.installed_upstream
    }

    /// The donor spec a spliced package must be rewired against, when this
    /// spec was produced by splicing rather than a from-scratch concretization.
    pub fn build_spec(&self) -> Option<&Arc<PackageSpec>> {
        self.build_spec.as_ref()
    }

    pub fn edges(&self) -> &[DepEdge] {
        &self.dependencies
    }

    /// Direct dependencies whose edge matches any of the given flags.
    pub fn dependencies(&self, depflag: DepFlag) -> Vec<Arc<PackageSpec>> {
        self.dependencies
            .iter()
            .filter(|edge| edge.depflag.intersects(depflag))
            .map(|edge| Arc::clone(&edge.spec))
            .collect()
    }

    /// Deduplicated post-order traversal of the dependency subtree, excluding
    /// this node. The depflag honored at each node is recomputed by the
    /// caller's policy, so a uniform-deptype walk is deliberately not offered.
    pub fn traverse_dependencies<F>(&self, mut depflags_for: F) -> Vec<Arc<PackageSpec>>
    where
        F: FnMut(&PackageSpec) -> DepFlag,
    {
        let mut visited = HashSet::new();
        let mut ordered = Vec::new();
        visited.insert(package_id(self));
        for dep in self.dependencies(depflags_for(self)) {
            visit_post_order(&dep, &mut depflags_for, &mut visited, &mut ordered);
        }
        ordered
    }
}

fn visit_post_order<F>(
    spec: &Arc<PackageSpec>,
    depflags_for: &mut F,
    visited: &mut HashSet<String>,
    ordered: &mut Vec<Arc<PackageSpec>>,
) where
    F: FnMut(&PackageSpec) -> DepFlag,
{
    let id = package_id(spec);
    if !visited.insert(id) {
        return;
    }
    for dep in spec.dependencies(depflags_for(spec)) {
        visit_post_order(&dep, depflags_for, visited, ordered);
    }
    ordered.push(Arc::clone(spec));
}

/// The unique installation identifier for a concrete spec:
/// `name-version-hash`.
pub fn package_id(spec: &PackageSpec) -> String {
    format!("{}-{}-{}", spec.name, spec.version, spec.dag_hash)
}

/// Builder for [`PackageSpec`] nodes. `build` concretizes the node by
/// computing its dag hash over the (already concrete) dependency edges.
#[derive(Debug, Default)]
pub struct SpecBuilder {
    name: String,
    version: Option<Version>,
    external_path: Option<PathBuf>,
    installed_upstream: bool,
    dependencies: Vec<DepEdge>,
    build_spec: Option<Arc<PackageSpec>>,
}

impl SpecBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn external(mut self, path: impl Into<PathBuf>) -> Self {
        self.external_path = Some(path.into());
        self
    }

    pub fn installed_upstream(mut self) -> Self {
        self.installed_upstream = true;
        self
    }

    pub fn depends_on(mut self, spec: Arc<PackageSpec>, depflag: DepFlag) -> Self {
        self.dependencies.push(DepEdge { spec, depflag });
        self
    }

    pub fn build_spec(mut self, donor: Arc<PackageSpec>) -> Self {
        self.build_spec = Some(donor);
        self
    }

    pub fn build(self) -> Result<Arc<PackageSpec>> {
        let version = self.version.unwrap_or_else(|| Version::new(1, 0, 0));
        let mut seen = HashSet::new();
        for edge in &self.dependencies {
            if !edge.spec.is_concrete() {
                return Err(anyhow!(
                    "dependency '{}' of '{}' is not concrete",
                    edge.spec.name(),
                    self.name
                ));
            }
            if !seen.insert(package_id(&edge.spec)) {
                return Err(anyhow!(
                    "duplicate dependency edge '{}' on '{}'",
                    edge.spec.name(),
                    self.name
                ));
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(version.to_string().as_bytes());
        let mut edge_keys: Vec<String> = self
            .dependencies
            .iter()
            .map(|edge| format!("{}:{}", package_id(&edge.spec), edge.depflag))
            .collect();
        edge_keys.sort();
        for key in edge_keys {
            hasher.update(key.as_bytes());
        }
        if let Some(donor) = &self.build_spec {
            hasher.update(donor.dag_hash().as_bytes());
        }
        let dag_hash = hex::encode(&hasher.finalize()[..16]);

        Ok(Arc::new(PackageSpec {
            name: self.name,
            version,
            dag_hash,
            external_path: self.external_path,
            installed_upstream: self.installed_upstream,
            dependencies: self.dependencies,
            build_spec: self.build_spec,
        }))
    }

    /// Produce an abstract (non-concrete) spec. Only useful for exercising
    /// the fail-fast concreteness guards.
    pub fn build_abstract(self) -> Arc<PackageSpec> {
        Arc::new(PackageSpec {
            name: self.name,
            version: self.version.unwrap_or_else(|| Version::new(1, 0, 0)),
            dag_hash: String::new(),
            external_path: self.external_path,
            installed_upstream: self.installed_upstream,
            dependencies: self.dependencies,
            build_spec: self.build_spec,
        })
    }
}
