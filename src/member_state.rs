/*!
 * Externally visible replica set member states
 */

use std::fmt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Startup,
    Startup2,
    Primary,
    Secondary,
    Recovering,
    Rollback,
    Arbiter,
    Down,
    Removed,
    Unknown,
}

impl MemberState {
    pub fn primary(&self) -> bool {
        matches!(self, MemberState::Primary)
    }

    pub fn secondary(&self) -> bool {
        matches!(self, MemberState::Secondary)
    }

    pub fn removed(&self) -> bool {
        matches!(self, MemberState::Removed)
    }

    /// States a node may read from when the caller did not set slave-ok.
    pub fn readable(&self) -> bool {
        self.primary() || self.secondary()
    }
}

impl Default for MemberState {
    fn default() -> Self {
        MemberState::Startup
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberState::Startup => "STARTUP",
            MemberState::Startup2 => "STARTUP2",
            MemberState::Primary => "PRIMARY",
            MemberState::Secondary => "SECONDARY",
            MemberState::Recovering => "RECOVERING",
            MemberState::Rollback => "ROLLBACK",
            MemberState::Arbiter => "ARBITER",
            MemberState::Down => "DOWN",
            MemberState::Removed => "REMOVED",
            MemberState::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}
