//! Immutable, versioned views of a whole signal tree.

use crate::id::Id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// One node in a tree: an optional JSON value plus list and map children.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeData {
    pub parent: Option<Id>,
    /// Id of the last command that modified this node.
    pub last_update: Option<Id>,
    /// Owner whose `ClearOwner` command removes this node.
    #[serde(default)]
    pub scope_owner: Option<Id>,
    pub value: Option<Value>,
    pub list_children: Vec<Id>,
    pub map_children: BTreeMap<String, Id>,
}

impl NodeData {
    pub(crate) fn detached(last_update: Id, scope_owner: Option<Id>, value: Option<Value>) -> Self {
        Self {
            parent: None,
            last_update: Some(last_update),
            scope_owner,
            value,
            list_children: Vec::new(),
            map_children: BTreeMap::new(),
        }
    }

    /// List children followed by map children.
    pub fn children(&self) -> impl Iterator<Item = Id> + '_ {
        self.list_children
            .iter()
            .chain(self.map_children.values())
            .copied()
    }
}

/// Immutable tree state.
///
/// Snapshots are only produced by [`TreeRevisionBuilder`](crate::TreeRevisionBuilder)
/// (or [`Snapshot::initial`]) and are shared as `Arc<Snapshot>`. Two
/// snapshots are only meaningfully comparable when they share a `tree_id`.
///
/// Besides data nodes a snapshot holds aliases: ids created by a
/// `PutIfAbsent` that found its key taken, which resolve to the node that
/// already owned the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    tree_id: Id,
    is_initial: bool,
    nodes: HashMap<Id, NodeData>,
    #[serde(default)]
    aliases: HashMap<Id, Id>,
}

impl Snapshot {
    /// Snapshot with only an empty root node.
    pub fn initial(tree_id: Id) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(Id::ZERO, NodeData::default());
        Self { tree_id, is_initial: true, nodes, aliases: HashMap::new() }
    }

    pub(crate) fn from_parts(tree_id: Id, nodes: HashMap<Id, NodeData>, aliases: HashMap<Id, Id>) -> Self {
        Self { tree_id, is_initial: false, nodes, aliases }
    }

    pub fn tree_id(&self) -> Id {
        self.tree_id
    }

    pub fn is_initial(&self) -> bool {
        self.is_initial
    }

    pub fn nodes(&self) -> &HashMap<Id, NodeData> {
        &self.nodes
    }

    pub fn aliases(&self) -> &HashMap<Id, Id> {
        &self.aliases
    }

    /// The data node `id` refers to, following an alias if there is one.
    pub fn resolve_alias(&self, id: Id) -> Id {
        self.aliases.get(&id).copied().unwrap_or(id)
    }

    pub fn data(&self, id: Id) -> Option<&NodeData> {
        self.nodes.get(&self.resolve_alias(id))
    }

    pub fn value(&self, id: Id) -> Option<&Value> {
        self.data(id).and_then(|node| node.value.as_ref())
    }

    /// The root node. Only a snapshot deserialized from a malformed image
    /// can lack one.
    pub fn root(&self) -> Option<&NodeData> {
        self.nodes.get(&Id::ZERO)
    }

    /// Whether `id` carries different data here than in `other`.
    pub fn node_differs(&self, other: &Snapshot, id: Id) -> bool {
        self.data(id) != other.data(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_snapshot_has_an_empty_root() {
        let snapshot = Snapshot::initial(Id::random());

        assert!(snapshot.is_initial());
        assert_eq!(snapshot.nodes().len(), 1);

        let root = snapshot.root().unwrap();
        assert_eq!(root.value, None);
        assert!(root.list_children.is_empty());
        assert!(root.map_children.is_empty());
    }

    #[test]
    fn image_without_root_has_no_root() {
        let json = format!(r#"{{"tree_id":"{}","is_initial":false,"nodes":{{}}}}"#, Id::random().as_uuid());
        let snapshot: Snapshot = serde_json::from_str(&json).unwrap();

        assert!(snapshot.root().is_none());
        assert!(snapshot.aliases().is_empty());
    }

    #[test]
    fn alias_reads_through_to_its_target() {
        let child = Id::random();
        let alias = Id::random();
        let mut nodes = HashMap::new();
        nodes.insert(Id::ZERO, NodeData::default());
        nodes.insert(child, NodeData { parent: Some(Id::ZERO), value: Some(Value::from(1)), ..NodeData::default() });
        let snapshot = Snapshot::from_parts(Id::random(), nodes, HashMap::from([(alias, child)]));

        assert_eq!(snapshot.resolve_alias(alias), child);
        assert_eq!(snapshot.value(alias), Some(&Value::from(1)));
        assert_eq!(snapshot.data(alias), snapshot.data(child));
    }
}
