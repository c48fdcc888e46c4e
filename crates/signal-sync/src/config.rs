use crate::id::Id;

/// Settings for a signal tree.
///
/// ```ignore
/// let config = TreeConfig::default()
///     .with_tree_id(tree_id)
///     .with_pending_limit(1_000);
/// ```
#[derive(Debug, Clone)]
pub struct TreeConfig {
    tree_id: Id,
    pending_limit: Option<usize>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            tree_id: Id::random(),
            pending_limit: None,
        }
    }
}

impl TreeConfig {
    /// Use a fixed tree id instead of a random one, e.g. when several
    /// processes replicate the same tree.
    pub fn with_tree_id(mut self, tree_id: Id) -> Self {
        self.tree_id = tree_id;
        self
    }

    /// Cap the number of unconfirmed commands an asynchronous tree will
    /// hold. Once reached, further local commits fail synchronously with
    /// [`SignalError::PendingLimitExceeded`](crate::SignalError) until
    /// confirmations drain the queue. Unbounded by default.
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = Some(limit);
        self
    }

    pub fn tree_id(&self) -> Id {
        self.tree_id
    }

    pub fn pending_limit(&self) -> Option<usize> {
        self.pending_limit
    }
}
