mod depflag;
mod spec;

pub use depflag::DepFlag;
pub use spec::{package_id, DepEdge, PackageSpec, SpecBuilder};

#[cfg(test)]
mod tests;
