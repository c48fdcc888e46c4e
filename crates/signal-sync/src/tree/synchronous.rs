//! Tree without an external authority: every commit is confirmed on the spot.

use super::{PendingCommit, Publication, SignalTree, TreeCore, TreeState};
use crate::command::SignalCommand;
use crate::error::{Result, SignalError};
use crate::id::Id;
use crate::pending::{CommandsAndHandlers, ResultHandler};
use crate::result::CommandResult;
use crate::revision::TreeRevisionBuilder;
use crate::snapshot::Snapshot;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Immediately consistent tree. `confirmed` and `submitted` are always the
/// same snapshot, and a commit either applies all of its commands or none.
#[derive(Debug)]
pub struct SynchronousSignalTree {
    core: TreeCore,
}

impl SynchronousSignalTree {
    pub fn new(tree_id: Id) -> Self {
        Self { core: TreeCore::new(tree_id) }
    }
}

impl SignalTree for SynchronousSignalTree {
    fn core(&self) -> &TreeCore {
        &self.core
    }

    fn prepare_commit(&self, state: &TreeState, changes: CommandsAndHandlers) -> Result<Box<dyn PendingCommit>> {
        let mut builder = TreeRevisionBuilder::new(&state.confirmed);
        let results = builder.apply_and_get_results(changes.commands());
        let accepted = changes
            .commands()
            .iter()
            .all(|command| results.get(&command.command_id).is_some_and(CommandResult::accepted));

        let (commands, handlers) = changes.into_parts();
        Ok(Box::new(SynchronousCommit {
            tree_id: self.core.id(),
            snapshot: accepted.then(|| Arc::new(builder.build())),
            commands,
            handlers,
            results,
            previous: None,
        }))
    }
}

struct SynchronousCommit {
    tree_id: Id,
    /// Only present when every command was accepted.
    snapshot: Option<Arc<Snapshot>>,
    commands: Vec<SignalCommand>,
    handlers: HashMap<Id, ResultHandler>,
    results: HashMap<Id, CommandResult>,
    previous: Option<Arc<Snapshot>>,
}

impl PendingCommit for SynchronousCommit {
    fn can_commit(&self) -> bool {
        self.snapshot.is_some()
    }

    fn apply_changes(&mut self, state: &mut TreeState) -> Result<()> {
        let snapshot = self.snapshot.clone().ok_or(SignalError::NotCommittable)?;
        self.previous = Some(std::mem::replace(&mut state.submitted, snapshot.clone()));
        state.confirmed = snapshot;
        Ok(())
    }

    fn publish_changes(&mut self, state: &mut TreeState) -> Result<()> {
        let new = self.snapshot.clone().ok_or(SignalError::NotCommittable)?;
        if let Some(old) = self.previous.take() {
            state.publish(Publication::SubmittedChanged { old, new });
        }

        debug!(tree_id = %self.tree_id, commands = self.commands.len(), "Committed synchronously");

        let handlers = std::mem::take(&mut self.handlers);
        state.publish(Publication::Resolve(pair_with_results(handlers, &self.results, |_| {
            CommandResult::Accept
        })));
        state.publish(Publication::Processed {
            commands: std::mem::take(&mut self.commands),
            results: std::mem::take(&mut self.results),
        });
        Ok(())
    }

    fn mark_as_aborted(&mut self, state: &mut TreeState) -> Result<()> {
        debug!(tree_id = %self.tree_id, commands = self.commands.len(), "Aborted synchronous commit");

        // Accepted members of an aborted commit are reported as aborted too.
        let mut results = std::mem::take(&mut self.results);
        for id in self.commands.iter().flat_map(SignalCommand::all_ids) {
            let entry = results.entry(id).or_insert(CommandResult::Accept);
            if entry.accepted() {
                *entry = CommandResult::reject("Transaction aborted");
            }
        }

        let handlers = std::mem::take(&mut self.handlers);
        state.publish(Publication::Resolve(pair_with_results(handlers, &results, |_| {
            CommandResult::reject("Transaction aborted")
        })));
        state.publish(Publication::Processed {
            commands: std::mem::take(&mut self.commands),
            results,
        });
        Ok(())
    }
}

/// Pairs every handler with the result of its id, using `fallback` for ids
/// that produced no result.
fn pair_with_results(
    handlers: HashMap<Id, ResultHandler>,
    results: &HashMap<Id, CommandResult>,
    fallback: impl Fn(Id) -> CommandResult,
) -> Vec<(ResultHandler, CommandResult)> {
    handlers
        .into_iter()
        .map(|(id, handler)| {
            let result = results.get(&id).cloned().unwrap_or_else(|| fallback(id));
            (handler, result)
        })
        .collect()
}
