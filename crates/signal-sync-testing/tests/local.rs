//! Local trees confirmed by their own worker task.

use anyhow::Result;
use serde_json::json;
use signal_sync::{AsynchronousSignalTree, Id, ResultOrError, SignalCommand, SignalTree, TreeConfig, ValueSignal};
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn operation_resolves_after_worker_confirms() -> Result<()> {
    let tree = AsynchronousSignalTree::local(TreeConfig::default())?;

    let operation = tree.commit_with_operation(SignalCommand::set(Id::ZERO, json!("hi")))?;
    // The worker cannot have run yet: confirmation never happens inside commit.
    assert!(!operation.is_done());

    let result = timeout(Duration::from_secs(5), operation.wait()).await?;

    assert_eq!(result, ResultOrError::Value(()));
    assert_eq!(tree.confirmed().value(Id::ZERO), Some(&json!("hi")));
    Ok(())
}

#[tokio::test]
async fn restored_tree_resubmits_pending_commands() -> Result<()> {
    let tree = AsynchronousSignalTree::local(TreeConfig::default())?;
    let counter = ValueSignal::<f64>::root(tree.clone());
    timeout(Duration::from_secs(5), counter.set(5.0)?.wait()).await?;

    let mut image = tree.export_image();
    image.pending.push(SignalCommand::increment(Id::ZERO, 1.5));
    drop(counter);
    drop(tree);

    let restored = AsynchronousSignalTree::restore_local(image, TreeConfig::default())?;
    let counter = ValueSignal::<f64>::root(restored.clone());
    assert_eq!(counter.value()?, Some(6.5));
    assert_eq!(counter.confirmed_value()?, Some(5.0));

    let check = counter.verify_value(6.5)?;
    assert_eq!(timeout(Duration::from_secs(5), check.wait()).await?, ResultOrError::Value(true));
    assert_eq!(restored.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn pending_limit_applies_to_local_trees() -> Result<()> {
    let tree = AsynchronousSignalTree::local(TreeConfig::default().with_pending_limit(2))?;

    tree.commit_single_command(SignalCommand::set(Id::ZERO, json!(1)))?;
    tree.commit_single_command(SignalCommand::set(Id::ZERO, json!(2)))?;
    assert!(tree.commit_single_command(SignalCommand::set(Id::ZERO, json!(3))).is_err());

    // Once the worker catches up there is room again.
    while tree.pending_count() > 0 {
        tokio::task::yield_now().await;
    }
    let operation = tree.commit_with_operation(SignalCommand::set(Id::ZERO, json!(3)))?;
    assert!(timeout(Duration::from_secs(5), operation.wait()).await?.successful());
    Ok(())
}
