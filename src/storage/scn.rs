use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// System commit number, the commit marker of a version.
///
/// Assigned at commit time and totally ordered. Snapshot reads compare against
/// it and recovery replays in increasing scn order per row.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Scn(u64);

impl Scn {
    pub const MIN: Scn = Scn(0);
    pub const MAX: Scn = Scn(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Saturating predecessor
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl From<u64> for Scn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for Scn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Scn::MAX => write!(f, "MAX"),
            Scn(v) => write!(f, "{}", v),
        }
    }
}
