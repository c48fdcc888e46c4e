//! Tree whose commits are confirmed later by an external ordering authority.
//!
//! ## Confirmation
//!
//! Local commits stack optimistically on top of `submitted` and are handed to
//! a [`CommandSubmitter`]. The authority eventually feeds an ordered batch
//! back through [`AsynchronousSignalTree::confirm`], possibly mixed with
//! commands from other processes:
//!
//! ```text
//! confirm(batch)
//!     │
//!     ├─► confirmed' = confirmed + batch          results per id
//!     │
//!     ├─► batch all accepted and a prefix of the pending queue?
//!     │       yes ─► submitted unchanged          (nothing to replay)
//!     │       no  ─► submitted = confirmed' + remaining queue
//!     │              notify the transition
//!     │
//!     ├─► resolve handlers of confirmed ids
//!     └─► notify processed subscribers
//! ```

use super::{PendingCommit, Publication, SignalTree, TreeCore, TreeState};
use crate::command::SignalCommand;
use crate::config::TreeConfig;
use crate::error::{Result, SignalError};
use crate::id::Id;
use crate::pending::CommandsAndHandlers;
use crate::result::CommandResult;
use crate::revision::TreeRevisionBuilder;
use crate::snapshot::Snapshot;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Outbound seam to the ordering authority.
///
/// `submit` is called after the tree lock has been released, in the order
/// the commits happened. It must not block on confirmation; the authority
/// answers later by calling [`AsynchronousSignalTree::confirm`].
pub trait CommandSubmitter: Send + Sync + 'static {
    fn submit(&self, commands: Vec<SignalCommand>);
}

/// Eventually consistent tree reconciling optimistic local commits with the
/// order decided by an external authority.
pub struct AsynchronousSignalTree {
    core: TreeCore,
    submitter: Arc<dyn CommandSubmitter>,
    pending_limit: Option<usize>,
}

impl AsynchronousSignalTree {
    pub fn new(config: TreeConfig, submitter: Arc<dyn CommandSubmitter>) -> Self {
        Self::with_confirmed(Snapshot::initial(config.tree_id()), &config, submitter)
    }

    pub(crate) fn with_confirmed(
        confirmed: Snapshot,
        config: &TreeConfig,
        submitter: Arc<dyn CommandSubmitter>,
    ) -> Self {
        Self {
            core: TreeCore::with_confirmed(confirmed),
            submitter,
            pending_limit: config.pending_limit(),
        }
    }

    /// Number of local commands still waiting for confirmation.
    pub fn pending_count(&self) -> usize {
        self.core.get_with_lock(|state| state.unconfirmed.len())
    }

    /// Applies a batch in the order decided by the authority.
    pub fn confirm(&self, commands: Vec<SignalCommand>) {
        let tree_id = self.core.id();
        self.core.run_with_lock(|state| {
            let mut builder = TreeRevisionBuilder::new(&state.confirmed);
            let results = builder.apply_and_get_results(&commands);
            state.confirmed = Arc::new(builder.build());

            let rejected = commands
                .iter()
                .filter(|command| !results.get(&command.command_id).is_some_and(CommandResult::accepted))
                .count();
            let from_head = rejected == 0 && state.unconfirmed.starts_with(&commands);

            let handlers = state.unconfirmed.remove_handled_commands(&results);

            if from_head {
                debug!(%tree_id, commands = commands.len(), "Confirmed head of pending queue");
            } else {
                let submitted = if state.unconfirmed.is_empty() {
                    state.confirmed.clone()
                } else {
                    let mut builder = TreeRevisionBuilder::new(&state.confirmed);
                    builder.apply_all(state.unconfirmed.commands());
                    Arc::new(builder.build())
                };
                debug!(
                    %tree_id,
                    commands = commands.len(),
                    pending = state.unconfirmed.len(),
                    "Rebuilt submitted snapshot after confirmation"
                );
                let old = std::mem::replace(&mut state.submitted, submitted.clone());
                state.publish(Publication::SubmittedChanged { old, new: submitted });
            }

            if rejected > 0 {
                warn!(%tree_id, rejected, "Authority rejected commands");
            }

            state.publish(Publication::Resolve(handlers));
            state.publish(Publication::Processed { commands, results });
        });
    }
}

impl SignalTree for AsynchronousSignalTree {
    fn core(&self) -> &TreeCore {
        &self.core
    }

    fn prepare_commit(&self, state: &TreeState, changes: CommandsAndHandlers) -> Result<Box<dyn PendingCommit>> {
        if let Some(limit) = self.pending_limit {
            let pending = state.unconfirmed.len();
            if pending + changes.len() > limit {
                warn!(tree_id = %self.core.id(), pending, limit, "Refusing commit over pending limit");
                return Err(SignalError::PendingLimitExceeded { pending, limit });
            }
        }

        let mut builder = TreeRevisionBuilder::new(&state.submitted);
        builder.apply_all(changes.commands());

        Ok(Box::new(AsynchronousCommit {
            tree_id: self.core.id(),
            snapshot: Arc::new(builder.build()),
            changes: Some(changes),
            submitted_commands: Vec::new(),
            previous: None,
            submitter: self.submitter.clone(),
        }))
    }
}

impl std::fmt::Debug for AsynchronousSignalTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsynchronousSignalTree")
            .field("core", &self.core)
            .field("pending_limit", &self.pending_limit)
            .finish_non_exhaustive()
    }
}

struct AsynchronousCommit {
    tree_id: Id,
    snapshot: Arc<Snapshot>,
    changes: Option<CommandsAndHandlers>,
    submitted_commands: Vec<SignalCommand>,
    previous: Option<Arc<Snapshot>>,
    submitter: Arc<dyn CommandSubmitter>,
}

impl PendingCommit for AsynchronousCommit {
    fn can_commit(&self) -> bool {
        true
    }

    fn apply_changes(&mut self, state: &mut TreeState) -> Result<()> {
        let changes = self
            .changes
            .take()
            .ok_or(SignalError::UnsupportedOperation("changes were already applied"))?;
        self.submitted_commands = changes.commands().to_vec();
        state.unconfirmed.append(changes);
        self.previous = Some(std::mem::replace(&mut state.submitted, self.snapshot.clone()));
        Ok(())
    }

    fn publish_changes(&mut self, state: &mut TreeState) -> Result<()> {
        let old = self
            .previous
            .take()
            .ok_or(SignalError::UnsupportedOperation("changes must be applied before publishing"))?;
        let commands = std::mem::take(&mut self.submitted_commands);
        debug!(tree_id = %self.tree_id, commands = commands.len(), "Submitting commands");

        state.publish(Publication::SubmittedChanged { old, new: self.snapshot.clone() });
        state.publish(Publication::Submit { submitter: self.submitter.clone(), commands });
        Ok(())
    }

    fn mark_as_aborted(&mut self, _state: &mut TreeState) -> Result<()> {
        error!(tree_id = %self.tree_id, "Asynchronous commits cannot be aborted");
        Err(SignalError::UnsupportedOperation("asynchronous commits cannot be aborted"))
    }
}
