//! # Shared Counter Example
//!
//! Two replicas of one counter tree share an in-process command log, and a
//! third tree is confirmed by its own local worker. Run with
//! `RUST_LOG=debug` to watch commits, confirmations and rebuilds.

use anyhow::Result;
use futures::future::join_all;
use signal_sync::{AsynchronousSignalTree, Id, SignalTree, TreeConfig, ValueSignal};
use signal_sync_testing::SharedLog;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Replicas behind a shared log
// ============================================================================

fn replicas() -> Result<()> {
    let log = SharedLog::new();
    let tree_id = Id::random();
    let left = log.attach(TreeConfig::default().with_tree_id(tree_id));
    let right = log.attach(TreeConfig::default().with_tree_id(tree_id));

    let left_counter = ValueSignal::<f64>::root(left.clone());
    let right_counter = ValueSignal::<f64>::root(right.clone());

    // Both replicas increment optimistically from the same starting point.
    let from_left = left_counter.update(|value| value.unwrap_or_default() + 1.0)?;
    let from_right = right_counter.update(|value| value.unwrap_or_default() + 10.0)?;
    info!(
        left = ?left_counter.value()?,
        right = ?right_counter.value()?,
        "Before delivery"
    );

    // The right replica loses the race and retries against the new value.
    let delivered = log.deliver_all();
    info!(
        delivered,
        left = ?left_counter.confirmed_value()?,
        right = ?right_counter.confirmed_value()?,
        left_previous = ?from_left.result(),
        right_previous = ?from_right.result(),
        "After delivery"
    );

    Ok(())
}

// ============================================================================
// Local worker
// ============================================================================

async fn local_worker() -> Result<()> {
    let tree = AsynchronousSignalTree::local(TreeConfig::default())?;
    let counter = ValueSignal::<f64>::root(tree.clone());

    let subscription = tree.core().observe_submitted(|old, new| {
        info!(
            old = ?old.value(Id::ZERO),
            new = ?new.value(Id::ZERO),
            "Submitted snapshot changed"
        );
    });

    let updates = (0..5)
        .map(|_| counter.update(|value| value.unwrap_or_default() + 1.0))
        .collect::<signal_sync::Result<Vec<_>>>()?;
    info!(optimistic = ?counter.value()?, pending = tree.pending_count(), "Committed updates");

    for result in join_all(updates.iter().map(|update| update.wait())).await {
        info!(?result, "Update confirmed");
    }
    subscription.cancel();

    let image = serde_json::to_string_pretty(&tree.export_image())?;
    info!(confirmed = ?counter.confirmed_value()?, "Local tree settled");
    println!("{image}");

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    replicas()?;
    local_worker().await?;

    println!("Shared counter demo complete!");
    Ok(())
}
