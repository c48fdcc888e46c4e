//! Commands: identified, immutable descriptions of one state change.
//!
//! A command is the unit that travels through the pending queue, gets
//! submitted to the ordering authority and comes back in a `confirm` call.
//! Results are reported per command id, including the ids of commands nested
//! inside a [`CommandPayload::Transaction`].

use crate::id::Id;
use crate::snapshot::NodeData;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Position in a node's list children, expressed relative to neighbours.
///
/// `after` and `before` may each be a sibling id or [`Id::EDGE`]. When both
/// are set they must agree, which lets a writer insert "between these two"
/// and get rejected if a concurrent insert landed in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPosition {
    pub after: Option<Id>,
    pub before: Option<Id>,
}

impl ListPosition {
    pub fn first() -> Self {
        Self { after: Some(Id::EDGE), before: None }
    }

    pub fn last() -> Self {
        Self { after: None, before: Some(Id::EDGE) }
    }

    pub fn after(sibling: Id) -> Self {
        Self { after: Some(sibling), before: None }
    }

    pub fn before(sibling: Id) -> Self {
        Self { after: None, before: Some(sibling) }
    }

    pub fn between(after: Id, before: Id) -> Self {
        Self { after: Some(after), before: Some(before) }
    }
}

/// What a [`CommandPayload::KeyCondition`] expects to find under its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyExpectation {
    Present,
    Absent,
    Child(Id),
}

/// The state change a command describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    ValueCondition {
        target: Id,
        expected: Option<Value>,
    },
    KeyCondition {
        target: Id,
        key: String,
        expected: KeyExpectation,
    },
    LastUpdateCondition {
        target: Id,
        expected: Option<Id>,
    },
    PositionCondition {
        target: Id,
        child: Id,
        position: ListPosition,
    },
    Set {
        target: Id,
        value: Option<Value>,
    },
    Increment {
        target: Id,
        delta: f64,
    },
    /// Creates a node with the command's id and attaches it to `target`'s list.
    Insert {
        target: Id,
        #[serde(default)]
        scope_owner: Option<Id>,
        value: Option<Value>,
        position: ListPosition,
    },
    /// Sets the value of the child under `key`, creating it if missing.
    Put {
        target: Id,
        key: String,
        value: Option<Value>,
    },
    /// Creates a child under `key` with the command's id unless the key is
    /// taken. When it is, the command's id becomes an alias of the existing
    /// child, so writers racing on one key all end up addressing one node.
    PutIfAbsent {
        target: Id,
        key: String,
        #[serde(default)]
        scope_owner: Option<Id>,
        value: Option<Value>,
    },
    RemoveByKey {
        target: Id,
        key: String,
    },
    /// Removes `target` itself, optionally checking its parent first.
    Remove {
        target: Id,
        expected_parent: Option<Id>,
    },
    Clear {
        target: Id,
    },
    AdoptAt {
        target: Id,
        child: Id,
        position: ListPosition,
    },
    AdoptAs {
        target: Id,
        key: String,
        child: Id,
    },
    /// Removes every node created with `owner` as its scope owner.
    ClearOwner {
        owner: Id,
    },
    /// All-or-nothing group of commands, applied in order.
    Transaction {
        commands: Vec<SignalCommand>,
    },
    /// Replaces the whole tree with the given nodes.
    Snapshot {
        nodes: HashMap<Id, NodeData>,
        #[serde(default)]
        aliases: HashMap<Id, Id>,
    },
}

impl CommandPayload {
    /// Node the command operates on. Commands that act on the whole tree
    /// target the root.
    pub fn target(&self) -> Id {
        match self {
            CommandPayload::ValueCondition { target, .. }
            | CommandPayload::KeyCondition { target, .. }
            | CommandPayload::LastUpdateCondition { target, .. }
            | CommandPayload::PositionCondition { target, .. }
            | CommandPayload::Set { target, .. }
            | CommandPayload::Increment { target, .. }
            | CommandPayload::Insert { target, .. }
            | CommandPayload::Put { target, .. }
            | CommandPayload::PutIfAbsent { target, .. }
            | CommandPayload::RemoveByKey { target, .. }
            | CommandPayload::Remove { target, .. }
            | CommandPayload::Clear { target }
            | CommandPayload::AdoptAt { target, .. }
            | CommandPayload::AdoptAs { target, .. } => *target,
            CommandPayload::ClearOwner { .. }
            | CommandPayload::Transaction { .. }
            | CommandPayload::Snapshot { .. } => Id::ZERO,
        }
    }

    /// Whether the command only tests the tree and never changes it.
    pub fn is_condition(&self) -> bool {
        matches!(
            self,
            CommandPayload::ValueCondition { .. }
                | CommandPayload::KeyCondition { .. }
                | CommandPayload::LastUpdateCondition { .. }
                | CommandPayload::PositionCondition { .. }
        )
    }
}

/// An identified, immutable instruction for one state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCommand {
    pub command_id: Id,
    pub payload: CommandPayload,
}

impl SignalCommand {
    pub fn new(command_id: Id, payload: CommandPayload) -> Self {
        Self { command_id, payload }
    }

    /// Creates a command with a fresh random id.
    pub fn random(payload: CommandPayload) -> Self {
        Self::new(Id::random(), payload)
    }

    pub fn set(target: Id, value: impl Into<Option<Value>>) -> Self {
        Self::random(CommandPayload::Set { target, value: value.into() })
    }

    pub fn increment(target: Id, delta: f64) -> Self {
        Self::random(CommandPayload::Increment { target, delta })
    }

    pub fn value_condition(target: Id, expected: impl Into<Option<Value>>) -> Self {
        Self::random(CommandPayload::ValueCondition { target, expected: expected.into() })
    }

    pub fn put_if_absent(target: Id, key: impl Into<String>, value: impl Into<Option<Value>>) -> Self {
        Self::random(CommandPayload::PutIfAbsent {
            target,
            key: key.into(),
            scope_owner: None,
            value: value.into(),
        })
    }

    pub fn clear_owner(owner: Id) -> Self {
        Self::random(CommandPayload::ClearOwner { owner })
    }

    pub fn transaction(commands: Vec<SignalCommand>) -> Self {
        Self::random(CommandPayload::Transaction { commands })
    }

    pub fn target(&self) -> Id {
        self.payload.target()
    }

    /// This command's id followed by the ids of all nested commands, depth first.
    pub fn all_ids(&self) -> Vec<Id> {
        let mut ids = vec![self.command_id];
        if let CommandPayload::Transaction { commands } = &self.payload {
            for nested in commands {
                ids.extend(nested.all_ids());
            }
        }
        ids
    }
}
