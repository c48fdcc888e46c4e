//! Building new snapshots by applying commands to an existing one.
//!
//! Every command is evaluated against a staged overlay
//! and merged into the builder only if it is accepted, so a rejected command
//! never leaves half of its effect behind. Transactions go one level further
//! and run their nested commands against a scratch copy of the builder that
//! is discarded on the first rejection.
//!
//! Ids passed in commands may be aliases left behind by `PutIfAbsent`. They
//! are resolved to the node they stand for before any lookup, so an alias
//! can be used anywhere a node id can.

use crate::command::{CommandPayload, KeyExpectation, ListPosition, SignalCommand};
use crate::id::Id;
use crate::result::CommandResult;
use crate::snapshot::{NodeData, Snapshot};
use serde_json::{Number, Value};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};

type Outcome<T = ()> = Result<T, &'static str>;

/// Mutable working copy of a snapshot.
#[derive(Debug, Clone)]
pub struct TreeRevisionBuilder {
    tree_id: Id,
    nodes: HashMap<Id, NodeData>,
    aliases: HashMap<Id, Id>,
}

impl TreeRevisionBuilder {
    pub fn new(base: &Snapshot) -> Self {
        Self {
            tree_id: base.tree_id(),
            nodes: base.nodes().clone(),
            aliases: base.aliases().clone(),
        }
    }

    fn resolve_alias(&self, id: Id) -> Id {
        self.aliases.get(&id).copied().unwrap_or(id)
    }

    pub fn data(&self, id: Id) -> Option<&NodeData> {
        self.nodes.get(&self.resolve_alias(id))
    }

    /// Applies `commands` in order and ignores the results.
    pub fn apply_all(&mut self, commands: &[SignalCommand]) {
        let mut ignored = HashMap::new();
        for command in commands {
            self.apply(command, &mut ignored);
        }
    }

    /// Applies `commands` in order and returns the result of every command
    /// id, nested transaction members included.
    pub fn apply_and_get_results(&mut self, commands: &[SignalCommand]) -> HashMap<Id, CommandResult> {
        let mut results = HashMap::new();
        for command in commands {
            self.apply(command, &mut results);
        }
        results
    }

    /// Applies a single command, records its result (and those of any
    /// nested commands) in `results`, and returns the top-level result.
    pub fn apply(&mut self, command: &SignalCommand, results: &mut HashMap<Id, CommandResult>) -> CommandResult {
        let result = match &command.payload {
            _ if self.data(command.target()).is_none() => CommandResult::reject("Node not found"),
            CommandPayload::Transaction { commands } => self.apply_transaction(commands, results),
            CommandPayload::Snapshot { nodes, aliases } => self.load(nodes, aliases),
            payload if payload.is_condition() => TreeManipulator::new(self, command.command_id).test(payload),
            payload => {
                let mut manipulator = TreeManipulator::new(self, command.command_id);
                match manipulator.handle(payload) {
                    Ok(()) => {
                        let changes = manipulator.into_changes();
                        self.merge(changes);
                        CommandResult::Accept
                    }
                    Err(reason) => CommandResult::reject(reason),
                }
            }
        };

        results.insert(command.command_id, result.clone());
        result
    }

    fn merge(&mut self, changes: Changes) {
        for id in &changes.removals {
            self.nodes.remove(id);
        }
        self.nodes.extend(changes.updates);
        self.aliases.extend(changes.aliases);
        if !changes.removals.is_empty() {
            // An alias goes away together with the node it stands for.
            self.aliases
                .retain(|alias, target| !changes.removals.contains(target) && !changes.removals.contains(alias));
        }
    }

    fn load(&mut self, nodes: &HashMap<Id, NodeData>, aliases: &HashMap<Id, Id>) -> CommandResult {
        if !nodes.contains_key(&Id::ZERO) {
            return CommandResult::reject("Snapshot has no root");
        }
        self.nodes = nodes.clone();
        self.aliases = aliases.clone();
        CommandResult::Accept
    }

    fn apply_transaction(
        &mut self,
        commands: &[SignalCommand],
        results: &mut HashMap<Id, CommandResult>,
    ) -> CommandResult {
        let mut scratchpad = self.clone();
        let mut nested_results = HashMap::new();

        let first_reject = commands
            .iter()
            .map(|command| scratchpad.apply(command, &mut nested_results))
            .find(|result| !result.accepted());

        let result = match first_reject {
            None => {
                *self = scratchpad;
                CommandResult::Accept
            }
            Some(reject) => {
                // Members that would have been accepted are reported with the
                // rejection that sank the transaction, at any nesting depth.
                for id in commands.iter().flat_map(SignalCommand::all_ids) {
                    let rejected = nested_results.get(&id).is_some_and(|r| !r.accepted());
                    if !rejected {
                        nested_results.insert(id, reject.clone());
                    }
                }
                reject
            }
        };

        results.extend(nested_results);
        result
    }

    pub fn build(self) -> Snapshot {
        Snapshot::from_parts(self.tree_id, self.nodes, self.aliases)
    }
}

/// Everything an accepted command changes in the builder.
struct Changes {
    updates: HashMap<Id, NodeData>,
    removals: HashSet<Id>,
    aliases: HashMap<Id, Id>,
}

/// Staged changes for one command on top of the builder's nodes.
struct TreeManipulator<'a> {
    base: &'a TreeRevisionBuilder,
    command_id: Id,
    updated: HashMap<Id, NodeData>,
    detached: HashSet<Id>,
    aliases: HashMap<Id, Id>,
}

impl<'a> TreeManipulator<'a> {
    fn new(base: &'a TreeRevisionBuilder, command_id: Id) -> Self {
        Self {
            base,
            command_id,
            updated: HashMap::new(),
            detached: HashSet::new(),
            aliases: HashMap::new(),
        }
    }

    fn resolve(&self, id: Id) -> Id {
        self.aliases
            .get(&id)
            .copied()
            .unwrap_or_else(|| self.base.resolve_alias(id))
    }

    fn resolve_position(&self, position: ListPosition) -> ListPosition {
        ListPosition {
            after: position.after.map(|id| self.resolve(id)),
            before: position.before.map(|id| self.resolve(id)),
        }
    }

    fn raw(&self, id: Id) -> Option<&NodeData> {
        let id = self.resolve(id);
        self.updated.get(&id).or_else(|| self.base.nodes.get(&id))
    }

    /// Current data of an attached (or never detached) node.
    fn data(&self, id: Id) -> Option<&NodeData> {
        if self.detached.contains(&self.resolve(id)) {
            None
        } else {
            self.raw(id)
        }
    }

    /// Resolved id and current data of a node that must exist.
    fn require(&self, id: Id) -> Outcome<(Id, NodeData)> {
        let node = self.data(id).cloned().ok_or("Node not found")?;
        Ok((self.resolve(id), node))
    }

    fn value(&self, id: Id) -> Option<&Value> {
        self.data(id).and_then(|node| node.value.as_ref())
    }

    fn map_child(&self, id: Id, key: &str) -> Option<Id> {
        self.data(id).and_then(|node| node.map_children.get(key).copied())
    }

    fn list_children(&self, id: Id) -> &[Id] {
        self.data(id).map(|node| node.list_children.as_slice()).unwrap_or(&[])
    }

    fn same_node(&self, a: Option<Id>, b: Option<Id>) -> bool {
        a.map(|id| self.resolve(id)) == b.map(|id| self.resolve(id))
    }

    fn is_attached(&self, id: Id) -> bool {
        let mut current = Some(id);
        while let Some(id) = current {
            if id == Id::ZERO {
                return true;
            }
            current = self.data(id).and_then(|node| node.parent);
        }
        false
    }

    fn touch(&mut self, id: Id, mut node: NodeData) {
        node.last_update = Some(self.command_id);
        self.updated.insert(id, node);
    }

    fn set_value(&mut self, id: Id, value: Option<Value>) -> Outcome {
        let (id, mut node) = self.require(id)?;
        node.value = value;
        self.touch(id, node);
        Ok(())
    }

    fn create_node(&mut self, id: Id, scope_owner: Option<Id>, value: Option<Value>) -> Outcome {
        if self.data(id).is_some() {
            return Err("Node already exists");
        }
        self.detached.insert(id);
        self.updated
            .insert(id, NodeData::detached(self.command_id, scope_owner, value));
        Ok(())
    }

    fn detach(&mut self, id: Id) -> Outcome {
        let (id, node) = self.require(id)?;
        if id == Id::ZERO {
            return Err("Cannot detach the root");
        }
        let parent_id = node.parent.ok_or("Node is not attached")?;
        let (parent_id, mut parent) = self.require(parent_id)?;

        let key = parent
            .map_children
            .iter()
            .find(|(_, child)| **child == id)
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => {
                parent.map_children.remove(&key);
            }
            None => parent.list_children.retain(|child| *child != id),
        }

        self.touch(parent_id, parent);
        self.detached.insert(id);
        Ok(())
    }

    fn attach(
        &mut self,
        parent_id: Id,
        child_id: Id,
        attacher: impl FnOnce(&mut NodeData, Id) -> Outcome,
    ) -> Outcome {
        let child_id = self.resolve(child_id);
        if !self.detached.contains(&child_id) {
            return Err("Node is not detached");
        }

        let mut ancestor = Some(self.resolve(parent_id));
        while let Some(id) = ancestor {
            if id == child_id {
                return Err("Cannot attach to own descendant");
            }
            ancestor = self.data(id).and_then(|node| node.parent);
        }

        let (parent_id, mut parent) = self.require(parent_id)?;
        attacher(&mut parent, child_id)?;
        self.detached.remove(&child_id);

        let mut child = self.raw(child_id).cloned().ok_or("Node not found")?;
        child.parent = Some(parent_id);
        self.updated.insert(child_id, child);
        self.touch(parent_id, parent);
        Ok(())
    }

    fn attach_as(&mut self, parent_id: Id, key: &str, child_id: Id) -> Outcome {
        self.attach(parent_id, child_id, |parent, child| {
            if parent.map_children.contains_key(key) {
                return Err("Key is in use");
            }
            parent.map_children.insert(key.to_string(), child);
            Ok(())
        })
    }

    fn attach_at(&mut self, parent_id: Id, position: ListPosition, child_id: Id) -> Outcome {
        let position = self.resolve_position(position);
        self.attach(parent_id, child_id, |parent, child| {
            let index = find_insert_index(&parent.list_children, position)
                .ok_or("Insert position not matched")?;
            parent.list_children.insert(index, child);
            Ok(())
        })
    }

    /// Evaluates a condition against the current state.
    fn test(&self, payload: &CommandPayload) -> CommandResult {
        match payload {
            CommandPayload::ValueCondition { target, expected } => {
                CommandResult::conditional(same_value(self.value(*target), expected.as_ref()), "Unexpected value")
            }
            CommandPayload::KeyCondition { target, key, expected } => {
                let actual = self.map_child(*target, key);
                match expected {
                    KeyExpectation::Present => CommandResult::conditional(actual.is_some(), "Key not present"),
                    KeyExpectation::Absent => CommandResult::conditional(actual.is_none(), "A key is present"),
                    KeyExpectation::Child(child) => {
                        CommandResult::conditional(self.same_node(actual, Some(*child)), "Unexpected child")
                    }
                }
            }
            CommandPayload::LastUpdateCondition { target, expected } => {
                let last_update = self.data(*target).and_then(|node| node.last_update);
                CommandResult::conditional(last_update == *expected, "Unexpected last update")
            }
            CommandPayload::PositionCondition { target, child, position } => {
                match self.check_position(*target, *child, *position) {
                    Ok(()) => CommandResult::Accept,
                    Err(reason) => CommandResult::reject(reason),
                }
            }
            _ => CommandResult::reject("Not a condition"),
        }
    }

    fn handle(&mut self, payload: &CommandPayload) -> Outcome {
        match payload {
            CommandPayload::Set { target, value } => self.set_value(*target, value.clone()),
            CommandPayload::Increment { target, delta } => {
                let current = match self.value(*target) {
                    None | Some(Value::Null) => 0.0,
                    Some(Value::Number(number)) => number.as_f64().ok_or("Value is not numeric")?,
                    Some(_) => return Err("Value is not numeric"),
                };
                let next = Number::from_f64(current + delta).ok_or("Value is not numeric")?;
                self.set_value(*target, Some(Value::Number(next)))
            }
            CommandPayload::Insert { target, scope_owner, value, position } => {
                self.create_node(self.command_id, *scope_owner, value.clone())?;
                self.attach_at(*target, *position, self.command_id)
            }
            CommandPayload::Put { target, key, value } => match self.map_child(*target, key) {
                Some(child) => self.set_value(child, value.clone()),
                None => {
                    self.create_node(self.command_id, None, value.clone())?;
                    self.attach_as(*target, key, self.command_id)
                }
            },
            CommandPayload::PutIfAbsent { target, key, scope_owner, value } => {
                match self.map_child(*target, key) {
                    Some(child) => {
                        if self.data(self.command_id).is_some() {
                            return Err("Node already exists");
                        }
                        let child = self.resolve(child);
                        self.aliases.insert(self.command_id, child);
                        Ok(())
                    }
                    None => {
                        self.create_node(self.command_id, *scope_owner, value.clone())?;
                        self.attach_as(*target, key, self.command_id)
                    }
                }
            }
            CommandPayload::RemoveByKey { target, key } => {
                let child = self.map_child(*target, key).ok_or("Key not present")?;
                self.detach(child)
            }
            CommandPayload::Remove { target, expected_parent } => {
                if let Some(expected) = expected_parent {
                    let parent = self.data(*target).and_then(|node| node.parent);
                    if !self.same_node(parent, Some(*expected)) {
                        return Err("Not a child");
                    }
                }
                self.detach(*target)
            }
            CommandPayload::Clear { target } => {
                let (target, mut node) = self.require(*target)?;
                let children: Vec<Id> = node.children().collect();
                if children.is_empty() {
                    return Ok(());
                }
                self.detached.extend(children);
                node.list_children.clear();
                node.map_children.clear();
                self.touch(target, node);
                Ok(())
            }
            CommandPayload::AdoptAt { target, child, position } => {
                self.detach(*child)?;
                self.attach_at(*target, *position, *child)
            }
            CommandPayload::AdoptAs { target, key, child } => {
                self.detach(*child)?;
                self.attach_as(*target, key, *child)
            }
            CommandPayload::ClearOwner { owner } => {
                let owned: Vec<Id> = self
                    .base
                    .nodes
                    .iter()
                    .filter(|(id, node)| **id != Id::ZERO && node.scope_owner == Some(*owner))
                    .map(|(id, _)| *id)
                    .collect();
                for id in owned {
                    // Owned descendants of an owned node leave with their ancestor.
                    if self.is_attached(id) {
                        self.detach(id)?;
                    }
                }
                Ok(())
            }
            CommandPayload::ValueCondition { .. }
            | CommandPayload::KeyCondition { .. }
            | CommandPayload::LastUpdateCondition { .. }
            | CommandPayload::PositionCondition { .. }
            | CommandPayload::Transaction { .. }
            | CommandPayload::Snapshot { .. } => {
                unreachable!("conditions and whole-tree commands are applied by TreeRevisionBuilder")
            }
        }
    }

    fn check_position(&self, target: Id, child: Id, position: ListPosition) -> Outcome {
        let children = self.list_children(target);
        let child = self.resolve(child);
        let position = self.resolve_position(position);
        let index = children
            .iter()
            .position(|id| *id == child)
            .ok_or("Not a child")?;

        match position.after {
            None => {}
            Some(after) if after == Id::EDGE => check(index == 0, "Not the first child")?,
            Some(after) => check(
                index > 0 && children[index - 1] == after,
                "Not after the provided child",
            )?,
        }

        match position.before {
            None => Ok(()),
            Some(before) if before == Id::EDGE => check(index + 1 == children.len(), "Not the last child"),
            Some(before) => check(children.get(index + 1) == Some(&before), "Not before the provided child"),
        }
    }

    /// Final node writes, the ids to drop (detached subtrees included) and
    /// new aliases.
    fn into_changes(self) -> Changes {
        let mut removals = HashSet::new();
        let mut pending: SmallVec<[Id; 8]> = self.detached.iter().copied().collect();
        while let Some(id) = pending.pop() {
            if let Some(node) = self.updated.get(&id).or_else(|| self.base.nodes.get(&id)) {
                pending.extend(node.children());
            }
            removals.insert(id);
        }

        let detached = self.detached;
        let updates = self
            .updated
            .into_iter()
            .filter(|(id, _)| !detached.contains(id))
            .collect();
        Changes { updates, removals, aliases: self.aliases }
    }
}

fn check(condition: bool, reason: &'static str) -> Outcome {
    if condition {
        Ok(())
    } else {
        Err(reason)
    }
}

fn find_insert_index(children: &[Id], position: ListPosition) -> Option<usize> {
    match (position.after, position.before) {
        (Some(after), before) => {
            let index = if after == Id::EDGE {
                0
            } else {
                children.iter().position(|id| *id == after)? + 1
            };
            if let Some(before) = before {
                let at_index = children.get(index).copied().unwrap_or(Id::EDGE);
                if at_index != before {
                    return None;
                }
            }
            Some(index)
        }
        (None, Some(before)) if before == Id::EDGE => Some(children.len()),
        (None, Some(before)) => children.iter().position(|id| *id == before),
        (None, None) => None,
    }
}

/// JSON equality where a missing value equals `null` and numbers compare by
/// magnitude, so `1` and `1.0` match.
fn same_value(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    let actual = actual.unwrap_or(&Value::Null);
    let expected = expected.unwrap_or(&Value::Null);
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builder() -> TreeRevisionBuilder {
        TreeRevisionBuilder::new(&Snapshot::initial(Id::random()))
    }

    fn apply(builder: &mut TreeRevisionBuilder, payload: CommandPayload) -> (Id, CommandResult) {
        let command = SignalCommand::random(payload);
        let result = builder.apply(&command, &mut HashMap::new());
        (command.command_id, result)
    }

    fn insert_last(builder: &mut TreeRevisionBuilder, parent: Id, value: Value) -> Id {
        let (id, result) = apply(
            builder,
            CommandPayload::Insert { target: parent, scope_owner: None, value: Some(value), position: ListPosition::last() },
        );
        assert!(result.accepted());
        id
    }

    #[test]
    fn set_updates_root_value_and_last_update() {
        let mut builder = builder();
        let (id, result) = apply(&mut builder, CommandPayload::Set { target: Id::ZERO, value: Some(json!("a")) });

        assert!(result.accepted());
        let root = builder.data(Id::ZERO).unwrap();
        assert_eq!(root.value, Some(json!("a")));
        assert_eq!(root.last_update, Some(id));
    }

    #[test]
    fn increment_on_missing_value_starts_from_zero() {
        let mut builder = builder();
        apply(&mut builder, CommandPayload::Increment { target: Id::ZERO, delta: 2.0 });
        apply(&mut builder, CommandPayload::Increment { target: Id::ZERO, delta: 3.0 });

        assert_eq!(builder.data(Id::ZERO).unwrap().value, Some(json!(5.0)));
    }

    #[test]
    fn increment_on_text_is_rejected() {
        let mut builder = builder();
        apply(&mut builder, CommandPayload::Set { target: Id::ZERO, value: Some(json!("text")) });
        let (_, result) = apply(&mut builder, CommandPayload::Increment { target: Id::ZERO, delta: 1.0 });

        assert_eq!(result.reason(), Some("Value is not numeric"));
        assert_eq!(builder.data(Id::ZERO).unwrap().value, Some(json!("text")));
    }

    #[test]
    fn command_on_unknown_node_is_rejected() {
        let mut builder = builder();
        let (_, result) = apply(&mut builder, CommandPayload::Set { target: Id::random(), value: None });

        assert_eq!(result.reason(), Some("Node not found"));
    }

    #[test]
    fn inserts_respect_list_positions() {
        let mut builder = builder();
        let b = insert_last(&mut builder, Id::ZERO, json!("b"));
        let (a, _) = apply(
            &mut builder,
            CommandPayload::Insert { target: Id::ZERO, scope_owner: None, value: Some(json!("a")), position: ListPosition::first() },
        );
        let (c, _) = apply(
            &mut builder,
            CommandPayload::Insert { target: Id::ZERO, scope_owner: None, value: Some(json!("c")), position: ListPosition::after(b) },
        );

        assert_eq!(builder.data(Id::ZERO).unwrap().list_children, vec![a, b, c]);
        assert_eq!(builder.data(c).unwrap().parent, Some(Id::ZERO));
    }

    #[test]
    fn insert_between_non_adjacent_siblings_is_rejected() {
        let mut builder = builder();
        let a = insert_last(&mut builder, Id::ZERO, json!("a"));
        insert_last(&mut builder, Id::ZERO, json!("b"));
        let c = insert_last(&mut builder, Id::ZERO, json!("c"));

        let (id, result) = apply(
            &mut builder,
            CommandPayload::Insert { target: Id::ZERO, scope_owner: None, value: None, position: ListPosition::between(a, c) },
        );

        assert_eq!(result.reason(), Some("Insert position not matched"));
        assert!(builder.data(id).is_none());
        assert_eq!(builder.data(Id::ZERO).unwrap().list_children.len(), 3);
    }

    #[test]
    fn put_creates_then_updates_keyed_child() {
        let mut builder = builder();
        let (first, _) = apply(
            &mut builder,
            CommandPayload::Put { target: Id::ZERO, key: "k".into(), value: Some(json!(1)) },
        );
        apply(&mut builder, CommandPayload::Put { target: Id::ZERO, key: "k".into(), value: Some(json!(2)) });

        let root = builder.data(Id::ZERO).unwrap();
        assert_eq!(root.map_children.get("k"), Some(&first));
        assert_eq!(builder.data(first).unwrap().value, Some(json!(2)));
    }

    #[test]
    fn remove_by_key_drops_the_whole_subtree() {
        let mut builder = builder();
        let (child, _) = apply(&mut builder, CommandPayload::Put { target: Id::ZERO, key: "k".into(), value: None });
        let grandchild = insert_last(&mut builder, child, json!("deep"));

        let (_, result) = apply(&mut builder, CommandPayload::RemoveByKey { target: Id::ZERO, key: "k".into() });

        assert!(result.accepted());
        assert!(builder.data(child).is_none());
        assert!(builder.data(grandchild).is_none());
        assert!(builder.data(Id::ZERO).unwrap().map_children.is_empty());
    }

    #[test]
    fn remove_checks_expected_parent() {
        let mut builder = builder();
        let child = insert_last(&mut builder, Id::ZERO, json!(1));

        let (_, wrong) = apply(&mut builder, CommandPayload::Remove { target: child, expected_parent: Some(child) });
        assert_eq!(wrong.reason(), Some("Not a child"));

        let (_, right) = apply(&mut builder, CommandPayload::Remove { target: child, expected_parent: Some(Id::ZERO) });
        assert!(right.accepted());
        assert!(builder.data(Id::ZERO).unwrap().list_children.is_empty());
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut builder = builder();
        let (_, result) = apply(&mut builder, CommandPayload::Remove { target: Id::ZERO, expected_parent: None });

        assert_eq!(result.reason(), Some("Cannot detach the root"));
    }

    #[test]
    fn clear_removes_all_children() {
        let mut builder = builder();
        let listed = insert_last(&mut builder, Id::ZERO, json!(1));
        let (keyed, _) = apply(&mut builder, CommandPayload::Put { target: Id::ZERO, key: "k".into(), value: None });

        apply(&mut builder, CommandPayload::Clear { target: Id::ZERO });

        let root = builder.data(Id::ZERO).unwrap();
        assert!(root.list_children.is_empty());
        assert!(root.map_children.is_empty());
        assert!(builder.data(listed).is_none());
        assert!(builder.data(keyed).is_none());
    }

    #[test]
    fn adopt_moves_node_between_parents() {
        let mut builder = builder();
        let left = insert_last(&mut builder, Id::ZERO, json!("left"));
        let right = insert_last(&mut builder, Id::ZERO, json!("right"));

        let (_, result) = apply(
            &mut builder,
            CommandPayload::AdoptAs { target: left, key: "moved".into(), child: right },
        );

        assert!(result.accepted());
        assert_eq!(builder.data(Id::ZERO).unwrap().list_children, vec![left]);
        assert_eq!(builder.data(left).unwrap().map_children.get("moved"), Some(&right));
        assert_eq!(builder.data(right).unwrap().parent, Some(left));
    }

    #[test]
    fn adopt_into_own_descendant_is_rejected() {
        let mut builder = builder();
        let parent = insert_last(&mut builder, Id::ZERO, json!("parent"));
        let child = insert_last(&mut builder, parent, json!("child"));

        let (_, result) = apply(
            &mut builder,
            CommandPayload::AdoptAt { target: child, child: parent, position: ListPosition::last() },
        );

        assert_eq!(result.reason(), Some("Cannot attach to own descendant"));
        assert_eq!(builder.data(parent).unwrap().parent, Some(Id::ZERO));
    }

    #[test]
    fn conditions_compare_against_current_state() {
        let mut builder = builder();
        apply(&mut builder, CommandPayload::Set { target: Id::ZERO, value: Some(json!(1)) });
        let a = insert_last(&mut builder, Id::ZERO, json!("a"));
        let b = insert_last(&mut builder, Id::ZERO, json!("b"));

        let (_, value) = apply(&mut builder, CommandPayload::ValueCondition { target: Id::ZERO, expected: Some(json!(1.0)) });
        assert!(value.accepted());

        let (_, stale) = apply(&mut builder, CommandPayload::ValueCondition { target: Id::ZERO, expected: None });
        assert_eq!(stale.reason(), Some("Unexpected value"));

        let (_, position) = apply(
            &mut builder,
            CommandPayload::PositionCondition { target: Id::ZERO, child: b, position: ListPosition::between(a, Id::EDGE) },
        );
        assert!(position.accepted());

        let (_, first) = apply(
            &mut builder,
            CommandPayload::PositionCondition { target: Id::ZERO, child: b, position: ListPosition::first() },
        );
        assert_eq!(first.reason(), Some("Not the first child"));

        let (_, key) = apply(
            &mut builder,
            CommandPayload::KeyCondition { target: Id::ZERO, key: "missing".into(), expected: KeyExpectation::Absent },
        );
        assert!(key.accepted());

        let (_, last_update) = apply(
            &mut builder,
            CommandPayload::LastUpdateCondition { target: a, expected: Some(Id::random()) },
        );
        assert_eq!(last_update.reason(), Some("Unexpected last update"));
    }

    #[test]
    fn transaction_is_all_or_nothing() {
        let mut builder = builder();
        let set = SignalCommand::set(Id::ZERO, json!("text"));
        let increment = SignalCommand::increment(Id::ZERO, 1.0);
        let transaction = SignalCommand::transaction(vec![set.clone(), increment.clone()]);

        let mut results = HashMap::new();
        let result = builder.apply(&transaction, &mut results);

        assert_eq!(result.reason(), Some("Value is not numeric"));
        assert_eq!(results[&set.command_id].reason(), Some("Value is not numeric"));
        assert_eq!(results[&increment.command_id].reason(), Some("Value is not numeric"));
        assert_eq!(builder.data(Id::ZERO).unwrap().value, None);
    }

    #[test]
    fn accepted_transaction_reports_every_member() {
        let mut builder = builder();
        let condition = SignalCommand::value_condition(Id::ZERO, None);
        let set = SignalCommand::set(Id::ZERO, json!(2));
        let transaction = SignalCommand::transaction(vec![condition.clone(), set.clone()]);

        let results = builder.apply_and_get_results(std::slice::from_ref(&transaction));

        assert_eq!(results.len(), 3);
        assert!(results.values().all(CommandResult::accepted));
        assert_eq!(builder.build().value(Id::ZERO), Some(&json!(2)));
    }

    // ------------------------------------------------------------------------
    // Aliases
    // ------------------------------------------------------------------------

    fn put_if_absent(builder: &mut TreeRevisionBuilder, key: &str, value: Value) -> (Id, CommandResult) {
        apply(
            builder,
            CommandPayload::PutIfAbsent { target: Id::ZERO, key: key.into(), scope_owner: None, value: Some(value) },
        )
    }

    #[test]
    fn put_if_absent_creates_missing_child() {
        let mut builder = builder();

        let (id, result) = put_if_absent(&mut builder, "k", json!("first"));

        assert!(result.accepted());
        assert_eq!(builder.data(Id::ZERO).unwrap().map_children.get("k"), Some(&id));
        assert_eq!(builder.data(id).unwrap().value, Some(json!("first")));
        assert!(builder.build().aliases().is_empty());
    }

    #[test]
    fn put_if_absent_on_taken_key_aliases_existing_child() {
        let mut builder = builder();
        let (existing, _) = put_if_absent(&mut builder, "k", json!("first"));

        let (alias, result) = put_if_absent(&mut builder, "k", json!("second"));

        assert!(result.accepted());
        assert_eq!(builder.data(Id::ZERO).unwrap().map_children.len(), 1);
        assert_eq!(builder.data(alias), builder.data(existing));
        assert_eq!(builder.data(alias).unwrap().value, Some(json!("first")));

        let snapshot = builder.build();
        assert_eq!(snapshot.resolve_alias(alias), existing);
        assert!(!snapshot.nodes().contains_key(&alias));
    }

    #[test]
    fn writes_through_alias_reach_the_target() {
        let mut builder = builder();
        let (existing, _) = put_if_absent(&mut builder, "k", json!(1));
        let (alias, _) = put_if_absent(&mut builder, "k", json!(2));

        let (_, set) = apply(&mut builder, CommandPayload::Set { target: alias, value: Some(json!(5)) });
        let (_, child) = apply(
            &mut builder,
            CommandPayload::KeyCondition { target: Id::ZERO, key: "k".into(), expected: KeyExpectation::Child(alias) },
        );
        let inserted = insert_last(&mut builder, alias, json!("nested"));

        assert!(set.accepted());
        assert!(child.accepted());
        assert_eq!(builder.data(existing).unwrap().value, Some(json!(5)));
        assert_eq!(builder.data(existing).unwrap().list_children, vec![inserted]);
        assert_eq!(builder.data(inserted).unwrap().parent, Some(existing));
    }

    #[test]
    fn removing_aliased_node_drops_the_alias() {
        let mut builder = builder();
        let (existing, _) = put_if_absent(&mut builder, "k", json!(1));
        let (alias, _) = put_if_absent(&mut builder, "k", json!(2));

        let (_, result) = apply(&mut builder, CommandPayload::Remove { target: alias, expected_parent: Some(Id::ZERO) });

        assert!(result.accepted());
        assert!(builder.data(existing).is_none());
        assert!(builder.data(alias).is_none());
        assert!(builder.build().aliases().is_empty());
    }

    #[test]
    fn alias_cannot_reuse_an_existing_node_id() {
        let mut builder = builder();
        let taken = insert_last(&mut builder, Id::ZERO, json!("listed"));
        put_if_absent(&mut builder, "k", json!(1));

        let command = SignalCommand::new(
            taken,
            CommandPayload::PutIfAbsent { target: Id::ZERO, key: "k".into(), scope_owner: None, value: None },
        );
        let result = builder.apply(&command, &mut HashMap::new());

        assert_eq!(result.reason(), Some("Node already exists"));
    }

    // ------------------------------------------------------------------------
    // Scope owners and snapshots
    // ------------------------------------------------------------------------

    #[test]
    fn clear_owner_removes_owned_nodes_and_their_subtrees() {
        let mut builder = builder();
        let owner = Id::random();
        let (listed, _) = apply(
            &mut builder,
            CommandPayload::Insert { target: Id::ZERO, scope_owner: Some(owner), value: None, position: ListPosition::last() },
        );
        let (keyed, _) = apply(
            &mut builder,
            CommandPayload::PutIfAbsent { target: listed, key: "k".into(), scope_owner: Some(owner), value: None },
        );
        let grandchild = insert_last(&mut builder, keyed, json!("unowned"));
        let kept = insert_last(&mut builder, Id::ZERO, json!("kept"));

        let (_, result) = apply(&mut builder, CommandPayload::ClearOwner { owner });

        assert!(result.accepted());
        assert_eq!(builder.data(Id::ZERO).unwrap().list_children, vec![kept]);
        for removed in [listed, keyed, grandchild] {
            assert!(builder.data(removed).is_none());
        }
        assert_eq!(builder.build().nodes().len(), 2);
    }

    #[test]
    fn clear_owner_without_owned_nodes_changes_nothing() {
        let mut builder = builder();
        let child = insert_last(&mut builder, Id::ZERO, json!("a"));
        let before = builder.clone().build();

        let (_, result) = apply(&mut builder, CommandPayload::ClearOwner { owner: Id::random() });

        assert!(result.accepted());
        assert!(builder.data(child).is_some());
        assert_eq!(builder.build().nodes(), before.nodes());
    }

    #[test]
    fn snapshot_command_replaces_the_tree() {
        let mut source = builder();
        let (child, _) = apply(&mut source, CommandPayload::Put { target: Id::ZERO, key: "k".into(), value: None });
        let source = source.build();
        let mut builder = builder();
        insert_last(&mut builder, Id::ZERO, json!("discarded"));

        let (_, result) = apply(
            &mut builder,
            CommandPayload::Snapshot { nodes: source.nodes().clone(), aliases: HashMap::new() },
        );

        assert!(result.accepted());
        assert_eq!(builder.data(Id::ZERO).unwrap().map_children.get("k"), Some(&child));
        assert_eq!(builder.build().nodes(), source.nodes());
    }

    #[test]
    fn snapshot_without_root_is_rejected() {
        let mut builder = builder();

        let (_, result) = apply(&mut builder, CommandPayload::Snapshot { nodes: HashMap::new(), aliases: HashMap::new() });

        assert_eq!(result.reason(), Some("Snapshot has no root"));
        assert!(builder.data(Id::ZERO).is_some());
    }

    #[test]
    fn nested_rejection_is_reported_at_every_depth() {
        let mut builder = builder();
        let deep = SignalCommand::set(Id::ZERO, json!(1));
        let inner = SignalCommand::transaction(vec![deep.clone()]);
        let failing = SignalCommand::value_condition(Id::ZERO, json!("nope"));
        let outer = SignalCommand::transaction(vec![inner.clone(), failing.clone()]);

        let results = builder.apply_and_get_results(std::slice::from_ref(&outer));

        for id in [outer.command_id, inner.command_id, deep.command_id, failing.command_id] {
            assert_eq!(results[&id].reason(), Some("Unexpected value"));
        }
    }
}
