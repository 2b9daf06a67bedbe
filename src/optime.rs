/*!
 * Applied-position type for the replication subsystem
 */

use std::fmt;
use serde::{Deserialize, Serialize};

/// Position in the replication log: a (term epoch, sequence) pair ordered
/// lexicographically. The null position compares lowest and means "nothing
/// applied yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct OpTime {
    pub term: i64,
    pub seq: i64,
}

impl OpTime {
    pub const NULL: OpTime = OpTime { term: 0, seq: 0 };

    pub fn new(term: i64, seq: i64) -> Self {
        Self { term, seq }
    }

    pub fn is_null(&self) -> bool {
        *self == OpTime::NULL
    }

    pub fn to_document(&self) -> bson::Document {
        bson::doc! { "t": self.term, "i": self.seq }
    }

    pub fn from_document(doc: &bson::Document) -> Option<OpTime> {
        Some(OpTime {
            term: doc.get_i64("t").ok()?,
            seq: doc.get_i64("i").ok()?,
        })
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.term, self.seq)
    }
}
