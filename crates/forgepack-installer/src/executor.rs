use std::path::Path;

use anyhow::Result;
use forgepack_core::PackageSpec;

/// What a build produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The package was built into its prefix. `verbose` reports whether
    /// build output echoing should persist across subsequent installs.
    Built { verbose: bool },
    /// The caller asked to stop before an install phase. Not an error, and
    /// the package must not be marked failed.
    Stopped,
}

/// Context handed to the executor for one build.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub prefix: &'a Path,
    pub explicit: bool,
    pub verbose: bool,
    pub run_tests: bool,
}

/// The opaque collaborator that performs the actual build of one package in
/// an isolated context. The scheduler holds the package's write lock for the
/// whole call and registers the result in the database itself afterward.
pub trait BuildExecutor {
    /// Pre-install sanity hook. Returning `false` fails the task without
    /// raising.
    fn pre_install_check(&self, _spec: &PackageSpec) -> Result<bool> {
        Ok(true)
    }

    fn build(&self, spec: &PackageSpec, ctx: BuildContext<'_>) -> Result<BuildOutcome>;
}

impl<F> BuildExecutor for F
where
    F: Fn(&PackageSpec, BuildContext<'_>) -> Result<BuildOutcome>,
{
    fn build(&self, spec: &PackageSpec, ctx: BuildContext<'_>) -> Result<BuildOutcome> {
        self(spec, ctx)
    }
}
