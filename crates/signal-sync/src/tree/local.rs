//! Single-process authority: a per-tree worker task that confirms whatever
//! was submitted, in submission order.
//!
//! Confirmation always happens on the worker, never inside the caller's
//! commit, so a single process observes the same optimistic window it would
//! see behind a real command log. Each tree has its own channel and task,
//! so a slow tree never holds up another.

use super::{AsynchronousSignalTree, CommandSubmitter, SignalTree};
use crate::command::SignalCommand;
use crate::config::TreeConfig;
use crate::error::{Result, SignalError};
use crate::id::Id;
use crate::pending::CommandsAndHandlers;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Serializable state of an asynchronous tree: the confirmed nodes plus the
/// commands that were still waiting for confirmation. Result handlers are
/// not part of the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeImage {
    pub tree_id: Id,
    pub confirmed: Snapshot,
    pub pending: Vec<SignalCommand>,
}

struct LocalSubmitter {
    tree_id: Id,
    sender: mpsc::UnboundedSender<Vec<SignalCommand>>,
}

impl CommandSubmitter for LocalSubmitter {
    fn submit(&self, commands: Vec<SignalCommand>) {
        if self.sender.send(commands).is_err() {
            warn!(tree_id = %self.tree_id, "Confirmation worker has stopped; dropping submission");
        }
    }
}

impl AsynchronousSignalTree {
    /// Tree confirmed by its own worker task on the current tokio runtime.
    ///
    /// Fails with [`SignalError::NoRuntime`](crate::SignalError::NoRuntime)
    /// outside of a runtime.
    pub fn local(config: TreeConfig) -> Result<Arc<Self>> {
        let confirmed = Snapshot::initial(config.tree_id());
        Self::spawn_local(confirmed, &config)
    }

    /// Recreates a local tree from an image. Pending commands are replayed
    /// on top of the confirmed snapshot and submitted to the new worker.
    ///
    /// Fails with [`SignalError::InvalidImage`] when the image has no root
    /// node or disagrees with itself about the tree id.
    pub fn restore_local(image: TreeImage, config: TreeConfig) -> Result<Arc<Self>> {
        let TreeImage { tree_id, confirmed, pending } = image;
        if confirmed.root().is_none() {
            return Err(SignalError::InvalidImage("confirmed snapshot has no root node"));
        }
        if confirmed.tree_id() != tree_id {
            return Err(SignalError::InvalidImage("snapshot belongs to another tree"));
        }
        let config = config.with_tree_id(tree_id);
        let tree = Self::spawn_local(confirmed, &config)?;

        debug!(%tree_id, pending = pending.len(), "Restoring local tree");
        if !pending.is_empty() {
            tree.commit(CommandsAndHandlers::from_parts(pending, HashMap::new()))?;
        }
        Ok(tree)
    }

    /// Captures the confirmed snapshot and the pending queue.
    pub fn export_image(&self) -> TreeImage {
        self.core().get_with_lock(|state| TreeImage {
            tree_id: self.core().id(),
            confirmed: Snapshot::clone(state.confirmed()),
            pending: state.unconfirmed().commands().to_vec(),
        })
    }

    fn spawn_local(confirmed: Snapshot, config: &TreeConfig) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()?;
        let tree_id = config.tree_id();
        let (sender, receiver) = mpsc::unbounded_channel();
        let submitter = Arc::new(LocalSubmitter { tree_id, sender });

        Ok(Arc::new_cyclic(|tree| {
            runtime.spawn(run_worker(tree_id, tree.clone(), receiver));
            Self::with_confirmed(confirmed, config, submitter)
        }))
    }
}

async fn run_worker(
    tree_id: Id,
    tree: Weak<AsynchronousSignalTree>,
    mut receiver: mpsc::UnboundedReceiver<Vec<SignalCommand>>,
) {
    debug!(%tree_id, "Confirmation worker started");
    // The channel closes when the tree, which owns the sender, is dropped.
    while let Some(commands) = receiver.recv().await {
        let Some(tree) = tree.upgrade() else {
            break;
        };
        tree.confirm(commands);
    }
    debug!(%tree_id, "Confirmation worker stopped");
}
