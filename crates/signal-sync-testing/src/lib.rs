//! # Signal Sync Testing
//!
//! Authorities for driving asynchronous trees from tests.
//!
//! - [`ManualAuthority`] records submissions and confirms them only when told
//!   to, so a test controls exactly when (and in what order) commands land.
//! - [`SharedLog`] plays the part of a cluster-wide command log: several
//!   trees submit into one ordered log and every tree confirms every entry.
//!
//! ```ignore
//! let authority = ManualAuthority::new();
//! let tree = authority.tree(TreeConfig::default());
//!
//! tree.commit_single_command(SignalCommand::set(Id::ZERO, json!(1)))?;
//! assert_eq!(authority.pending_len(), 1);
//!
//! authority.confirm_all(&tree);
//! ```

use signal_sync::{AsynchronousSignalTree, CommandSubmitter, SignalCommand, TreeConfig};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

// ============================================================================
// ManualAuthority
// ============================================================================

/// Submitter that holds on to everything it receives until a test confirms it.
#[derive(Clone, Default)]
pub struct ManualAuthority {
    submitted: Arc<Mutex<Vec<SignalCommand>>>,
}

impl ManualAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asynchronous tree submitting to this authority.
    pub fn tree(&self, config: TreeConfig) -> Arc<AsynchronousSignalTree> {
        Arc::new(AsynchronousSignalTree::new(config, Arc::new(self.clone())))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SignalCommand>> {
        self.submitted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commands submitted and not yet taken, in submission order.
    pub fn pending(&self) -> Vec<SignalCommand> {
        self.lock().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    /// Removes and returns every recorded command.
    pub fn take(&self) -> Vec<SignalCommand> {
        std::mem::take(&mut *self.lock())
    }

    /// Confirms every recorded command on `tree` as one batch.
    pub fn confirm_all(&self, tree: &AsynchronousSignalTree) {
        let commands = self.take();
        debug!(commands = commands.len(), "Confirming all submitted commands");
        tree.confirm(commands);
    }

    /// Confirms the oldest recorded command, if any. Returns whether one was
    /// confirmed.
    pub fn confirm_next(&self, tree: &AsynchronousSignalTree) -> bool {
        let next = {
            let mut submitted = self.lock();
            if submitted.is_empty() {
                return false;
            }
            submitted.remove(0)
        };
        tree.confirm(vec![next]);
        true
    }
}

impl CommandSubmitter for ManualAuthority {
    fn submit(&self, commands: Vec<SignalCommand>) {
        self.lock().extend(commands);
    }
}

// ============================================================================
// SharedLog
// ============================================================================

#[derive(Default)]
struct LogState {
    entries: Vec<SignalCommand>,
    delivered: usize,
    trees: Vec<Weak<AsynchronousSignalTree>>,
}

/// Ordered command log shared by several trees of the same logical tree.
///
/// Submissions are appended in arrival order. [`deliver`](Self::deliver)
/// confirms all undelivered entries on every attached tree, so every
/// replica applies the same commands in the same order.
#[derive(Clone, Default)]
pub struct SharedLog {
    state: Arc<Mutex<LogState>>,
}

struct LogSubmitter {
    log: SharedLog,
}

impl CommandSubmitter for LogSubmitter {
    fn submit(&self, commands: Vec<SignalCommand>) {
        self.log.lock().entries.extend(commands);
    }
}

impl SharedLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// New replica submitting into this log. Replicas attached later only
    /// receive entries that are delivered after they joined.
    pub fn attach(&self, config: TreeConfig) -> Arc<AsynchronousSignalTree> {
        let submitter = Arc::new(LogSubmitter { log: self.clone() });
        let tree = Arc::new(AsynchronousSignalTree::new(config, submitter));
        self.lock().trees.push(Arc::downgrade(&tree));
        tree
    }

    /// Appends commands as if another process had submitted them.
    pub fn append(&self, commands: Vec<SignalCommand>) {
        self.lock().entries.extend(commands);
    }

    pub fn undelivered_len(&self) -> usize {
        let state = self.lock();
        state.entries.len() - state.delivered
    }

    /// Confirms every undelivered entry on every live replica. Returns the
    /// number of entries delivered.
    pub fn deliver(&self) -> usize {
        let (batch, trees) = {
            let mut state = self.lock();
            let batch = state.entries[state.delivered..].to_vec();
            state.delivered = state.entries.len();
            state.trees.retain(|tree| tree.strong_count() > 0);
            let trees: Vec<_> = state.trees.iter().filter_map(Weak::upgrade).collect();
            (batch, trees)
        };

        if batch.is_empty() {
            return 0;
        }
        debug!(entries = batch.len(), replicas = trees.len(), "Delivering shared log");
        for tree in trees {
            tree.confirm(batch.clone());
        }
        batch.len()
    }

    /// Delivers until confirmations stop producing new entries, e.g. when
    /// result handlers retry conflicting updates.
    pub fn deliver_all(&self) -> usize {
        let mut total = 0;
        loop {
            let delivered = self.deliver();
            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
    }
}
