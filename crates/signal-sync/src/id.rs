use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier for commands, nodes and trees.
///
/// A node created by a command gets the command's id, so the two id spaces
/// overlap on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(Uuid);

impl Id {
    /// Id of the root node of every tree.
    pub const ZERO: Id = Id(Uuid::nil());

    /// Marker for the start or end of a list in a [`ListPosition`](crate::ListPosition).
    pub const EDGE: Id = Id(Uuid::from_u128(u128::MAX));

    pub fn random() -> Self {
        Id(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> Self {
        Id(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Id(uuid)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Id::ZERO {
            f.write_str("root")
        } else if *self == Id::EDGE {
            f.write_str("edge")
        } else {
            write!(f, "{}", self.0.simple())
        }
    }
}
