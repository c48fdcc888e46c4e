//! The ordered backlog of locally submitted, not yet confirmed commands.

use crate::command::SignalCommand;
use crate::id::Id;
use crate::result::CommandResult;
use std::collections::HashMap;
use std::fmt;

/// Callback invoked once with the confirmed result of one command id.
pub type ResultHandler = Box<dyn FnOnce(CommandResult) + Send>;

/// Commands in submission order plus the handlers waiting for their results.
///
/// Handlers are keyed by command id and may target nested transaction
/// members as well as top-level commands. The command order is the replay
/// order and is never changed; entries only leave through
/// [`remove_handled_commands`](Self::remove_handled_commands).
#[derive(Default)]
pub struct CommandsAndHandlers {
    commands: Vec<SignalCommand>,
    handlers: HashMap<Id, ResultHandler>,
}

impl CommandsAndHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(command: SignalCommand) -> Self {
        Self { commands: vec![command], handlers: HashMap::new() }
    }

    pub fn with_handler(command: SignalCommand, handler: impl FnOnce(CommandResult) + Send + 'static) -> Self {
        let mut changes = Self::new();
        changes.add_command(command, Some(Box::new(handler)));
        changes
    }

    pub fn from_parts(commands: Vec<SignalCommand>, handlers: HashMap<Id, ResultHandler>) -> Self {
        Self { commands, handlers }
    }

    pub fn add_command(&mut self, command: SignalCommand, handler: Option<ResultHandler>) {
        if let Some(handler) = handler {
            self.handlers.insert(command.command_id, handler);
        }
        self.commands.push(command);
    }

    /// Registers a handler for any id, e.g. a command nested in a transaction.
    pub fn add_handler(&mut self, command_id: Id, handler: ResultHandler) {
        self.handlers.insert(command_id, handler);
    }

    /// Moves every command and handler of `other` to the end of this queue.
    pub fn append(&mut self, other: CommandsAndHandlers) {
        self.commands.extend(other.commands);
        self.handlers.extend(other.handlers);
    }

    pub fn commands(&self) -> &[SignalCommand] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether `batch` matches the head of this queue, command by command,
    /// compared by top-level id.
    pub fn starts_with(&self, batch: &[SignalCommand]) -> bool {
        batch.len() <= self.commands.len()
            && batch
                .iter()
                .zip(&self.commands)
                .all(|(confirmed, pending)| confirmed.command_id == pending.command_id)
    }

    /// Drops every command that has a result in `results` and returns the
    /// handlers for reported ids paired with their results, in queue order.
    pub fn remove_handled_commands(
        &mut self,
        results: &HashMap<Id, CommandResult>,
    ) -> Vec<(ResultHandler, CommandResult)> {
        let mut resolved = Vec::new();
        let handlers = &mut self.handlers;

        self.commands.retain(|command| {
            if !results.contains_key(&command.command_id) {
                return true;
            }
            for id in command.all_ids() {
                if let (Some(handler), Some(result)) = (handlers.remove(&id), results.get(&id)) {
                    resolved.push((handler, result.clone()));
                }
            }
            false
        });

        // Handlers registered for ids that were not part of a queued command.
        for (id, result) in results {
            if let Some(handler) = self.handlers.remove(id) {
                resolved.push((handler, result.clone()));
            }
        }

        resolved
    }

    /// Consumes the queue, returning all commands and the handler map.
    pub fn into_parts(self) -> (Vec<SignalCommand>, HashMap<Id, ResultHandler>) {
        (self.commands, self.handlers)
    }
}

impl fmt::Debug for CommandsAndHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandsAndHandlers")
            .field("commands", &self.commands)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
