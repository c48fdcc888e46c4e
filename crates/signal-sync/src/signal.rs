//! Typed access to a single value node of a tree.

use crate::command::SignalCommand;
use crate::error::Result;
use crate::id::Id;
use crate::operation::{CancelableOperation, Resolver, ResultOrError, SignalOperation};
use crate::pending::CommandsAndHandlers;
use crate::tree::SignalTree;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tracing::debug;

/// A node holding a single JSON-encoded value of type `T`.
///
/// Reads come from the submitted snapshot, so a local write is visible to
/// the next read even before it is confirmed.
pub struct ValueSignal<T> {
    tree: Arc<dyn SignalTree>,
    node_id: Id,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for ValueSignal<T> {
    fn clone(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            node_id: self.node_id,
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ValueSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueSignal")
            .field("tree_id", &self.tree.id())
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl<T> ValueSignal<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(tree: Arc<dyn SignalTree>, node_id: Id) -> Self {
        Self { tree, node_id, _value: PhantomData }
    }

    /// Signal backed by the root node of `tree`.
    pub fn root(tree: Arc<dyn SignalTree>) -> Self {
        Self::new(tree, Id::ZERO)
    }

    pub fn node_id(&self) -> Id {
        self.node_id
    }

    pub fn tree(&self) -> &Arc<dyn SignalTree> {
        &self.tree
    }

    /// Current value including unconfirmed local changes.
    pub fn value(&self) -> Result<Option<T>> {
        decode(self.tree.submitted().value(self.node_id))
    }

    /// Value as last confirmed by the authority.
    pub fn confirmed_value(&self) -> Result<Option<T>> {
        decode(self.tree.confirmed().value(self.node_id))
    }

    pub fn set(&self, value: T) -> Result<SignalOperation<()>> {
        let value = serde_json::to_value(value)?;
        self.tree.commit_with_operation(SignalCommand::set(self.node_id, value))
    }

    /// Adds `delta` to a numeric value. Rejected when the value is not a number.
    pub fn increment(&self, delta: f64) -> Result<SignalOperation<()>> {
        self.tree.commit_with_operation(SignalCommand::increment(self.node_id, delta))
    }

    /// Sets `new` only if the value still equals `expected`. Resolves with
    /// whether the replacement happened.
    pub fn replace(&self, expected: T, new: T) -> Result<SignalOperation<bool>> {
        let condition = SignalCommand::value_condition(self.node_id, serde_json::to_value(expected)?);
        let set = SignalCommand::set(self.node_id, serde_json::to_value(new)?);
        self.commit_check(SignalCommand::transaction(vec![condition, set]))
    }

    /// Resolves with whether the value equals `expected` at the point the
    /// check is confirmed. Never modifies the value.
    pub fn verify_value(&self, expected: T) -> Result<SignalOperation<bool>> {
        let condition = SignalCommand::value_condition(self.node_id, serde_json::to_value(expected)?);
        self.commit_check(condition)
    }

    fn commit_check(&self, command: SignalCommand) -> Result<SignalOperation<bool>> {
        let operation = SignalOperation::new();
        let resolver = operation.resolver();
        self.tree.commit(CommandsAndHandlers::with_handler(command, move |result| {
            let _ = resolver.resolve(ResultOrError::Value(result.accepted()));
        }))?;
        Ok(operation)
    }

    /// Replaces the value with `updater(current)`, retrying with the fresh
    /// value whenever a concurrent change wins, until the update is accepted
    /// or the operation is cancelled. Resolves with the value the accepted
    /// update replaced.
    ///
    /// A pending update does not keep the tree alive. If the tree is dropped
    /// first, the operation resolves with `"Operation abandoned"`.
    pub fn update(
        &self,
        updater: impl Fn(Option<T>) -> T + Send + Sync + 'static,
    ) -> Result<CancelableOperation<Option<T>>> {
        let operation = CancelableOperation::new();
        let attempt = Arc::new(UpdateAttempt {
            tree: Arc::downgrade(&self.tree),
            node_id: self.node_id,
            updater: Box::new(updater),
            resolver: operation.resolver(),
            operation: operation.clone(),
        });
        attempt.run()?;
        Ok(operation)
    }
}

/// One round of an [`update`](ValueSignal::update). The attempt lives in the
/// result handler of its queued command, which the tree owns, so it refers
/// back to the tree only weakly.
struct UpdateAttempt<T: Clone + Send + 'static> {
    tree: Weak<dyn SignalTree>,
    node_id: Id,
    updater: Box<dyn Fn(Option<T>) -> T + Send + Sync>,
    resolver: Resolver<Option<T>>,
    operation: CancelableOperation<Option<T>>,
}

impl<T> UpdateAttempt<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn run(self: &Arc<Self>) -> Result<()> {
        if self.operation.is_cancelled() {
            let _ = self.resolver.resolve(ResultOrError::Error("Operation cancelled".to_string()));
            return Ok(());
        }
        let Some(tree) = self.tree.upgrade() else {
            let _ = self.resolver.resolve(ResultOrError::Error("Operation abandoned".to_string()));
            return Ok(());
        };

        let node_id = self.node_id;
        let snapshot = tree.submitted();
        let Some(node) = snapshot.data(node_id) else {
            let _ = self.resolver.resolve(ResultOrError::Error("Node not found".to_string()));
            return Ok(());
        };

        let current_json = node.value.clone();
        let current: Option<T> = decode(current_json.as_ref())?;
        let next = serde_json::to_value((self.updater)(current.clone()))?;

        let transaction = SignalCommand::transaction(vec![
            SignalCommand::value_condition(node_id, current_json),
            SignalCommand::set(node_id, next),
        ]);

        let attempt = self.clone();
        tree.commit(CommandsAndHandlers::with_handler(transaction, move |result| {
            if result.accepted() {
                let _ = attempt.resolver.resolve(ResultOrError::Value(current));
                return;
            }
            debug!(%node_id, reason = result.reason(), "Retrying conflicting update");
            if let Err(error) = attempt.run() {
                let _ = attempt.resolver.resolve(ResultOrError::Error(error.to_string()));
            }
        }))?;
        Ok(())
    }
}

/// JSON null and a missing value both decode to `None`.
fn decode<T: DeserializeOwned>(value: Option<&Value>) -> Result<Option<T>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(T::deserialize(value)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::tree::{AsynchronousSignalTree, CommandSubmitter, SynchronousSignalTree};
    use serde_json::json;
    use std::sync::Mutex;

    fn synchronous<T>() -> ValueSignal<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        ValueSignal::root(Arc::new(SynchronousSignalTree::new(Id::random())))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SignalCommand>>);

    impl CommandSubmitter for Recorder {
        fn submit(&self, commands: Vec<SignalCommand>) {
            self.0.lock().unwrap().extend(commands);
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<SignalCommand> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    #[test]
    fn set_then_read() {
        let signal = synchronous::<String>();
        assert_eq!(signal.value().unwrap(), None);

        let operation = signal.set("hello".to_string()).unwrap();

        assert!(operation.result().unwrap().successful());
        assert_eq!(signal.value().unwrap(), Some("hello".to_string()));
        assert_eq!(signal.confirmed_value().unwrap(), Some("hello".to_string()));
    }

    #[test]
    fn increment_numeric_value() {
        let signal = synchronous::<f64>();
        signal.set(1.5).unwrap();

        signal.increment(2.0).unwrap();

        assert_eq!(signal.value().unwrap(), Some(3.5));
    }

    #[test]
    fn replace_reports_whether_it_happened() {
        let signal = synchronous::<String>();
        signal.set("a".to_string()).unwrap();

        let missed = signal.replace("b".to_string(), "c".to_string()).unwrap();
        let hit = signal.replace("a".to_string(), "c".to_string()).unwrap();

        assert_eq!(missed.result(), Some(ResultOrError::Value(false)));
        assert_eq!(hit.result(), Some(ResultOrError::Value(true)));
        assert_eq!(signal.value().unwrap(), Some("c".to_string()));
    }

    #[test]
    fn verify_value_does_not_modify() {
        let signal = synchronous::<i64>();
        signal.set(7).unwrap();

        let matches = signal.verify_value(7).unwrap();
        let differs = signal.verify_value(8).unwrap();

        assert_eq!(matches.result(), Some(ResultOrError::Value(true)));
        assert_eq!(differs.result(), Some(ResultOrError::Value(false)));
        assert_eq!(signal.value().unwrap(), Some(7));
    }

    #[test]
    fn update_resolves_with_previous_value() {
        let signal = synchronous::<i64>();
        signal.set(1).unwrap();

        let operation = signal.update(|value| value.unwrap_or_default() * 10).unwrap();

        assert_eq!(operation.result(), Some(ResultOrError::Value(Some(1))));
        assert_eq!(signal.value().unwrap(), Some(10));
    }

    #[test]
    fn update_of_missing_node_fails() {
        let signal: ValueSignal<i64> = ValueSignal::new(Arc::new(SynchronousSignalTree::new(Id::random())), Id::random());

        let operation = signal.update(|_| 1).unwrap();

        assert_eq!(operation.result(), Some(ResultOrError::Error("Node not found".to_string())));
    }

    #[test]
    fn update_retries_after_concurrent_change() {
        let recorder = Arc::new(Recorder::default());
        let tree = Arc::new(AsynchronousSignalTree::new(TreeConfig::default(), recorder.clone()));
        let signal = ValueSignal::<i64>::root(tree.clone());

        let operation = signal.update(|value| value.unwrap_or_default() + 1).unwrap();
        let first_attempt = recorder.take();

        // A foreign write lands first, so the conditional update is rejected.
        tree.confirm(vec![SignalCommand::set(Id::ZERO, json!(10))]);
        tree.confirm(first_attempt);
        assert!(!operation.is_done());

        tree.confirm(recorder.take());

        assert_eq!(operation.result(), Some(ResultOrError::Value(Some(10))));
        assert_eq!(signal.confirmed_value().unwrap(), Some(11));
    }

    #[test]
    fn cancelled_update_stops_retrying() {
        let recorder = Arc::new(Recorder::default());
        let tree = Arc::new(AsynchronousSignalTree::new(TreeConfig::default(), recorder.clone()));
        let signal = ValueSignal::<i64>::root(tree.clone());

        let operation = signal.update(|value| value.unwrap_or_default() + 1).unwrap();
        operation.cancel();
        tree.confirm(vec![SignalCommand::set(Id::ZERO, json!(10))]);
        tree.confirm(recorder.take());

        assert_eq!(operation.result(), Some(ResultOrError::Error("Operation cancelled".to_string())));
        assert!(recorder.take().is_empty());
        assert_eq!(tree.pending_count(), 0);
    }

    #[test]
    fn pending_update_does_not_keep_the_tree_alive() {
        let recorder = Arc::new(Recorder::default());
        let tree = Arc::new(AsynchronousSignalTree::new(TreeConfig::default(), recorder.clone()));
        let signal = ValueSignal::<i64>::root(tree.clone());
        let weak = Arc::downgrade(&tree);

        let operation = signal.update(|value| value.unwrap_or_default() + 1).unwrap();
        operation.cancel();
        drop(signal);
        drop(tree);

        assert!(weak.upgrade().is_none());
        assert_eq!(operation.result(), Some(ResultOrError::Error("Operation abandoned".to_string())));
    }
}
