use serde::{Deserialize, Serialize};

/// Outcome of applying one command to a tree revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    Accept,
    Reject { reason: String },
}

impl CommandResult {
    pub fn reject(reason: impl Into<String>) -> Self {
        CommandResult::Reject { reason: reason.into() }
    }

    pub fn conditional(accepted: bool, reason: &str) -> Self {
        if accepted {
            CommandResult::Accept
        } else {
            CommandResult::reject(reason)
        }
    }

    pub fn accepted(&self) -> bool {
        matches!(self, CommandResult::Accept)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            CommandResult::Accept => None,
            CommandResult::Reject { reason } => Some(reason),
        }
    }
}
