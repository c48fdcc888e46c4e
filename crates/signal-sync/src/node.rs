//! Untyped access to any node of a tree and to its children.

use crate::command::{CommandPayload, ListPosition, SignalCommand};
use crate::error::Result;
use crate::id::Id;
use crate::operation::SignalOperation;
use crate::signal::ValueSignal;
use crate::tree::SignalTree;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A node of a tree, addressed by id.
///
/// Reads come from the submitted snapshot. The id may be an alias created by
/// [`put_child_if_absent`](Self::put_child_if_absent); it then reads and
/// writes the node that already owned the key.
#[derive(Clone)]
pub struct NodeSignal {
    tree: Arc<dyn SignalTree>,
    node_id: Id,
}

/// Result of a command that creates a node: a signal for the node, usable
/// right away, and the eventual outcome of the command.
#[derive(Debug, Clone)]
pub struct InsertOperation {
    pub signal: NodeSignal,
    pub result: SignalOperation<()>,
}

impl NodeSignal {
    pub fn new(tree: Arc<dyn SignalTree>, node_id: Id) -> Self {
        Self { tree, node_id }
    }

    pub fn root(tree: Arc<dyn SignalTree>) -> Self {
        Self::new(tree, Id::ZERO)
    }

    pub fn id(&self) -> Id {
        self.node_id
    }

    fn child(&self, node_id: Id) -> NodeSignal {
        Self::new(self.tree.clone(), node_id)
    }

    /// Current value decoded as `T`. JSON null and a missing node or value
    /// read as `None`.
    pub fn value<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.tree.submitted().value(self.node_id) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(T::deserialize(value)?)),
        }
    }

    pub fn parent(&self) -> Option<NodeSignal> {
        let parent = self.tree.submitted().data(self.node_id)?.parent?;
        Some(self.child(parent))
    }

    pub fn list_children(&self) -> Vec<NodeSignal> {
        self.tree
            .submitted()
            .data(self.node_id)
            .map(|node| node.list_children.iter().map(|id| self.child(*id)).collect())
            .unwrap_or_default()
    }

    pub fn map_children(&self) -> BTreeMap<String, NodeSignal> {
        self.tree
            .submitted()
            .data(self.node_id)
            .map(|node| {
                node.map_children
                    .iter()
                    .map(|(key, id)| (key.clone(), self.child(*id)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Typed view of this node's value.
    pub fn as_value<T>(&self) -> ValueSignal<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        ValueSignal::new(self.tree.clone(), self.node_id)
    }

    pub fn insert_child_with_value(&self, value: impl Serialize, position: ListPosition) -> Result<InsertOperation> {
        let value = serde_json::to_value(value)?;
        self.submit_insert(CommandPayload::Insert {
            target: self.node_id,
            scope_owner: None,
            value: Some(value),
            position,
        })
    }

    pub fn insert_child(&self, position: ListPosition) -> Result<InsertOperation> {
        self.submit_insert(CommandPayload::Insert {
            target: self.node_id,
            scope_owner: None,
            value: None,
            position,
        })
    }

    pub fn put_child_with_value(&self, key: impl Into<String>, value: impl Serialize) -> Result<SignalOperation<()>> {
        let value = serde_json::to_value(value)?;
        self.submit(CommandPayload::Put {
            target: self.node_id,
            key: key.into(),
            value: Some(value),
        })
    }

    /// Creates an empty child under `key` unless one exists. The returned
    /// signal addresses the child under `key` either way, and the operation
    /// succeeds either way.
    pub fn put_child_if_absent(&self, key: impl Into<String>) -> Result<InsertOperation> {
        self.submit_insert(CommandPayload::PutIfAbsent {
            target: self.node_id,
            key: key.into(),
            scope_owner: None,
            value: None,
        })
    }

    /// Moves `node` into this node's list children.
    pub fn adopt_at(&self, node: &NodeSignal, position: ListPosition) -> Result<SignalOperation<()>> {
        self.submit(CommandPayload::AdoptAt {
            target: self.node_id,
            child: node.node_id,
            position,
        })
    }

    /// Moves `node` into this node's map children under `key`.
    pub fn adopt_as(&self, node: &NodeSignal, key: impl Into<String>) -> Result<SignalOperation<()>> {
        self.submit(CommandPayload::AdoptAs {
            target: self.node_id,
            key: key.into(),
            child: node.node_id,
        })
    }

    /// Removes `child`, failing with "Not a child" if it has moved elsewhere.
    pub fn remove_child(&self, child: &NodeSignal) -> Result<SignalOperation<()>> {
        self.submit(CommandPayload::Remove {
            target: child.node_id,
            expected_parent: Some(self.node_id),
        })
    }

    pub fn remove_child_by_key(&self, key: impl Into<String>) -> Result<SignalOperation<()>> {
        self.submit(CommandPayload::RemoveByKey {
            target: self.node_id,
            key: key.into(),
        })
    }

    pub fn clear(&self) -> Result<SignalOperation<()>> {
        self.submit(CommandPayload::Clear { target: self.node_id })
    }

    fn submit(&self, payload: CommandPayload) -> Result<SignalOperation<()>> {
        self.tree.commit_with_operation(SignalCommand::random(payload))
    }

    /// Commits a node-creating command. The new node takes the command's id.
    fn submit_insert(&self, payload: CommandPayload) -> Result<InsertOperation> {
        let command = SignalCommand::random(payload);
        let signal = self.child(command.command_id);
        let result = self.tree.commit_with_operation(command)?;
        Ok(InsertOperation { signal, result })
    }
}

impl PartialEq for NodeSignal {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.node_id == other.node_id
    }
}

impl fmt::Debug for NodeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSignal")
            .field("tree_id", &self.tree.id())
            .field("node_id", &self.node_id)
            .finish()
    }
}
