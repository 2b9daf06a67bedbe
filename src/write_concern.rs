/*!
 * Write concern options for replicated write acknowledgement
 */

use std::time::Duration;
use serde::{Deserialize, Serialize};

pub const MAJORITY_MODE: &str = "majority";

/// Internal write mode used by stepdown to check that at least one other
/// electable member has caught up.
pub const STEP_DOWN_CHECK_MODE: &str = "$stepDownCheck";

/// The durability predicate a write must satisfy before the client is told
/// it succeeded. Either a node count (`w_num_nodes`) or a named mode
/// (`w_mode`: "majority" or a tag pattern defined in the configuration).
/// An empty mode string means the numeric form applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w_num_nodes: i32,
    pub w_mode: String,
    /// None means wait forever.
    pub w_timeout: Option<Duration>,
}

impl WriteConcern {
    pub fn number(n: i32) -> Self {
        Self {
            w_num_nodes: n,
            w_mode: String::new(),
            w_timeout: None,
        }
    }

    pub fn majority() -> Self {
        Self {
            w_num_nodes: 0,
            w_mode: MAJORITY_MODE.to_string(),
            w_timeout: None,
        }
    }

    pub fn mode(mode: &str) -> Self {
        Self {
            w_num_nodes: 0,
            w_mode: mode.to_string(),
            w_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.w_timeout = Some(timeout);
        self
    }

    pub fn is_numeric(&self) -> bool {
        self.w_mode.is_empty()
    }
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::number(1)
    }
}
