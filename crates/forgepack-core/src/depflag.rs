use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Dependency-type flags for an edge in the package DAG.
///
/// A dependency may be needed at build time, at link time, at run time, or
/// only when the dependent's test suite is requested. Which flags an
/// installer honors for a given node is policy decided per build request,
/// not a property of the edge alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepFlag(u8);

impl DepFlag {
    pub const NONE: DepFlag = DepFlag(0);
    pub const BUILD: DepFlag = DepFlag(0b0001);
    pub const LINK: DepFlag = DepFlag(0b0010);
    pub const RUN: DepFlag = DepFlag(0b0100);
    pub const TEST: DepFlag = DepFlag(0b1000);
    pub const ALL: DepFlag = DepFlag(0b1111);

    pub fn contains(self, other: DepFlag) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: DepFlag) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DepFlag {
    type Output = DepFlag;

    fn bitor(self, rhs: DepFlag) -> DepFlag {
        DepFlag(self.0 | rhs.0)
    }
}

impl BitOrAssign for DepFlag {
    fn bitor_assign(&mut self, rhs: DepFlag) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DepFlag {
    type Output = DepFlag;

    fn bitand(self, rhs: DepFlag) -> DepFlag {
        DepFlag(self.0 & rhs.0)
    }
}

impl fmt::Display for DepFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(DepFlag::BUILD) {
            names.push("build");
        }
        if self.contains(DepFlag::LINK) {
            names.push("link");
        }
        if self.contains(DepFlag::RUN) {
            names.push("run");
        }
        if self.contains(DepFlag::TEST) {
            names.push("test");
        }
        if names.is_empty() {
            names.push("none");
        }
        write!(f, "{}", names.join("+"))
    }
}
