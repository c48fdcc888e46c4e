//! Signal trees: the lock, the snapshot pair and the commit protocol.
//!
//! ## Commit protocol
//!
//! ```text
//! commit(changes)
//!     │  lock
//!     ▼
//! prepare_commit(&state, changes) ──► PendingCommit
//!     │
//!     ├─ can_commit() ── true ──► apply_changes(&mut state)    snapshot visible
//!     │                           publish_changes(&mut state)  outbox ◄─ notifications, submit
//!     │
//!     └─ can_commit() ── false ─► mark_as_aborted(&mut state)  outbox ◄─ rejections
//!     │  unlock
//!     ▼
//! deliver outbox (in lock order, outside the lock)
//! ```
//!
//! Everything a commit or confirmation wants to tell the outside world goes
//! through the tree's outbox. The outbox is filled inside the critical
//! section and drained after the lock is released by whichever thread finds
//! it idle. Callbacks therefore never run under the tree lock, may call back
//! into the tree, and still observe events in the order the lock serialized
//! them.

mod asynchronous;
mod local;
mod synchronous;

pub use asynchronous::{AsynchronousSignalTree, CommandSubmitter};
pub use local::TreeImage;
pub use synchronous::SynchronousSignalTree;

use crate::command::SignalCommand;
use crate::error::Result;
use crate::id::Id;
use crate::operation::{ResultOrError, SignalOperation};
use crate::pending::{CommandsAndHandlers, ResultHandler};
use crate::result::CommandResult;
use crate::snapshot::Snapshot;
use dashmap::DashMap;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Everything guarded by a tree's lock.
pub struct TreeState {
    pub(crate) confirmed: Arc<Snapshot>,
    pub(crate) submitted: Arc<Snapshot>,
    pub(crate) unconfirmed: CommandsAndHandlers,
    outbox: VecDeque<Publication>,
    delivering: bool,
}

impl TreeState {
    fn new(confirmed: Arc<Snapshot>) -> Self {
        Self {
            submitted: confirmed.clone(),
            confirmed,
            unconfirmed: CommandsAndHandlers::new(),
            outbox: VecDeque::new(),
            delivering: false,
        }
    }

    pub fn confirmed(&self) -> &Arc<Snapshot> {
        &self.confirmed
    }

    pub fn submitted(&self) -> &Arc<Snapshot> {
        &self.submitted
    }

    pub fn unconfirmed(&self) -> &CommandsAndHandlers {
        &self.unconfirmed
    }

    /// Queues a publication to be delivered once the lock is released.
    pub(crate) fn publish(&mut self, publication: Publication) {
        self.outbox.push_back(publication);
    }
}

/// A notification or side effect produced under the lock.
pub(crate) enum Publication {
    SubmittedChanged {
        old: Arc<Snapshot>,
        new: Arc<Snapshot>,
    },
    Submit {
        submitter: Arc<dyn CommandSubmitter>,
        commands: Vec<SignalCommand>,
    },
    Resolve(Vec<(ResultHandler, CommandResult)>),
    Processed {
        commands: Vec<SignalCommand>,
        results: HashMap<Id, CommandResult>,
    },
}

/// A commit that has been prepared but not yet made visible.
pub trait PendingCommit: Send {
    /// Whether the changes can be applied. When false, only
    /// [`mark_as_aborted`](Self::mark_as_aborted) may be called.
    fn can_commit(&self) -> bool;

    /// Makes the prepared snapshot visible and updates the pending queue.
    fn apply_changes(&mut self, state: &mut TreeState) -> Result<()>;

    /// Queues observer notifications and any external submission.
    fn publish_changes(&mut self, state: &mut TreeState) -> Result<()>;

    /// Rolls back a commit that could not be committed and reports the
    /// outcome to its handlers.
    fn mark_as_aborted(&mut self, state: &mut TreeState) -> Result<()>;
}

/// Shared contract of synchronous and asynchronous trees.
pub trait SignalTree: Send + Sync {
    fn core(&self) -> &TreeCore;

    /// Prepares `changes` against the current state without making anything
    /// visible. Taking `&TreeState` means the caller holds the tree lock.
    fn prepare_commit(&self, state: &TreeState, changes: CommandsAndHandlers) -> Result<Box<dyn PendingCommit>>;

    fn id(&self) -> Id {
        self.core().id()
    }

    fn confirmed(&self) -> Arc<Snapshot> {
        self.core().get_with_lock(|state| state.confirmed.clone())
    }

    fn submitted(&self) -> Arc<Snapshot> {
        self.core().get_with_lock(|state| state.submitted.clone())
    }

    /// Runs the full commit protocol under the lock. Returns whether the
    /// changes were applied.
    fn commit(&self, changes: CommandsAndHandlers) -> Result<bool> {
        self.core().run_with_lock(|state| {
            let mut commit = self.prepare_commit(state, changes)?;
            if commit.can_commit() {
                commit.apply_changes(state)?;
                commit.publish_changes(state)?;
                Ok(true)
            } else {
                commit.mark_as_aborted(state)?;
                Ok(false)
            }
        })
    }

    fn commit_single_command(&self, command: SignalCommand) -> Result<bool> {
        self.commit(CommandsAndHandlers::single(command))
    }

    /// Commits `command` and returns an operation resolved with its result,
    /// or abandoned if the tree is dropped before the command is confirmed.
    fn commit_with_operation(&self, command: SignalCommand) -> Result<SignalOperation<()>> {
        let operation = SignalOperation::new();
        let resolver = operation.resolver();
        self.commit(CommandsAndHandlers::with_handler(command, move |result| {
            let _ = resolver.resolve(ResultOrError::from(result));
        }))?;
        Ok(operation)
    }
}

impl From<CommandResult> for ResultOrError<()> {
    fn from(result: CommandResult) -> Self {
        match result {
            CommandResult::Accept => ResultOrError::Value(()),
            CommandResult::Reject { reason } => ResultOrError::Error(reason),
        }
    }
}

// ============================================================================
// Lock ownership tracking
// ============================================================================

static NEXT_LOCK_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static HELD_LOCKS: RefCell<SmallVec<[u64; 4]>> = RefCell::new(SmallVec::new());
}

/// Marks a tree lock as held by the current thread for its lifetime.
struct HeldLock(u64);

impl HeldLock {
    fn enter(key: u64) -> Self {
        HELD_LOCKS.with(|held| held.borrow_mut().push(key));
        HeldLock(key)
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        HELD_LOCKS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(index) = held.iter().rposition(|key| *key == self.0) {
                held.remove(index);
            }
        });
    }
}

// ============================================================================
// Observers
// ============================================================================

type SubmittedObserver = Arc<dyn Fn(&Arc<Snapshot>, &Arc<Snapshot>) + Send + Sync>;
type ProcessedSubscriber = Arc<dyn Fn(&[SignalCommand], &HashMap<Id, CommandResult>) + Send + Sync>;

struct NodeObserver {
    active: Arc<AtomicBool>,
    callback: Box<dyn FnMut() -> bool + Send + Sync>,
}

#[derive(Default)]
struct Observers {
    next_key: AtomicU64,
    submitted: DashMap<u64, SubmittedObserver>,
    processed: DashMap<u64, ProcessedSubscriber>,
    nodes: DashMap<Id, Vec<NodeObserver>>,
}

enum Registration {
    Submitted(u64),
    Processed(u64),
    Node(Arc<AtomicBool>),
}

/// Handle for an observer registration.
///
/// Dropping it leaves the observer registered; call [`cancel`](Self::cancel)
/// to unregister.
pub struct Subscription {
    observers: Weak<Observers>,
    registration: Registration,
}

impl Subscription {
    pub fn cancel(self) {
        match self.registration {
            Registration::Submitted(key) => {
                if let Some(observers) = self.observers.upgrade() {
                    observers.submitted.remove(&key);
                }
            }
            Registration::Processed(key) => {
                if let Some(observers) = self.observers.upgrade() {
                    observers.processed.remove(&key);
                }
            }
            // Node observers may be detached while they run, so they are
            // flagged and swept on the next change instead.
            Registration::Node(active) => active.store(false, Ordering::SeqCst),
        }
    }
}

// ============================================================================
// TreeCore
// ============================================================================

/// Lock, snapshot pair and observer registries shared by all tree kinds.
pub struct TreeCore {
    id: Id,
    lock_key: u64,
    state: Mutex<TreeState>,
    observers: Arc<Observers>,
}

impl TreeCore {
    pub fn new(tree_id: Id) -> Self {
        Self::with_confirmed(Snapshot::initial(tree_id))
    }

    /// Core whose confirmed (and submitted) snapshot starts at `snapshot`.
    pub fn with_confirmed(snapshot: Snapshot) -> Self {
        Self {
            id: snapshot.tree_id(),
            lock_key: NEXT_LOCK_KEY.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TreeState::new(Arc::new(snapshot))),
            observers: Arc::new(Observers::default()),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Whether the current thread holds this tree's lock.
    pub fn has_lock(&self) -> bool {
        HELD_LOCKS.with(|held| held.borrow().contains(&self.lock_key))
    }

    fn lock_state(&self) -> MutexGuard<'_, TreeState> {
        debug_assert!(!self.has_lock(), "tree lock is not reentrant");
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the tree state, then delivers
    /// whatever `f` published.
    pub fn run_with_lock<R>(&self, f: impl FnOnce(&mut TreeState) -> R) -> R {
        let result = {
            let mut state = self.lock_state();
            let _held = HeldLock::enter(self.lock_key);
            f(&mut state)
        };
        self.deliver();
        result
    }

    /// Reads from the tree state under the lock.
    pub fn get_with_lock<R>(&self, f: impl FnOnce(&TreeState) -> R) -> R {
        let state = self.lock_state();
        let _held = HeldLock::enter(self.lock_key);
        f(&state)
    }

    /// Registers `observer` to be called with `(old, new)` every time the
    /// submitted snapshot changes.
    pub fn observe_submitted(
        &self,
        observer: impl Fn(&Arc<Snapshot>, &Arc<Snapshot>) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.observers.next_key.fetch_add(1, Ordering::Relaxed);
        self.observers.submitted.insert(key, Arc::new(observer));
        self.subscription(Registration::Submitted(key))
    }

    /// Registers `subscriber` to be called after every processed batch,
    /// whether or not the submitted snapshot changed.
    pub fn subscribe_to_processed(
        &self,
        subscriber: impl Fn(&[SignalCommand], &HashMap<Id, CommandResult>) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.observers.next_key.fetch_add(1, Ordering::Relaxed);
        self.observers.processed.insert(key, Arc::new(subscriber));
        self.subscription(Registration::Processed(key))
    }

    /// Calls `observer` the next time the data of `node_id` changes in the
    /// submitted snapshot. The observer stays registered for further
    /// changes as long as it returns `true`.
    pub fn observe_next_change(
        &self,
        node_id: Id,
        observer: impl FnMut() -> bool + Send + Sync + 'static,
    ) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        self.observers.nodes.entry(node_id).or_default().push(NodeObserver {
            active: active.clone(),
            callback: Box::new(observer),
        });
        self.subscription(Registration::Node(active))
    }

    fn subscription(&self, registration: Registration) -> Subscription {
        Subscription {
            observers: Arc::downgrade(&self.observers),
            registration,
        }
    }

    /// Drains the outbox unless another thread is already doing so.
    fn deliver(&self) {
        {
            let mut state = self.lock_state();
            if state.delivering || state.outbox.is_empty() {
                return;
            }
            state.delivering = true;
        }

        let _reset = DeliveryReset(self);
        loop {
            let publication = {
                let mut state = self.lock_state();
                match state.outbox.pop_front() {
                    Some(publication) => publication,
                    None => {
                        state.delivering = false;
                        return;
                    }
                }
            };
            self.dispatch(publication);
        }
    }

    fn dispatch(&self, publication: Publication) {
        match publication {
            Publication::SubmittedChanged { old, new } => {
                let observers: Vec<SubmittedObserver> = self
                    .observers
                    .submitted
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                for observer in observers {
                    observer(&old, &new);
                }
                self.notify_node_observers(&old, &new);
            }
            Publication::Submit { submitter, commands } => submitter.submit(commands),
            Publication::Resolve(handlers) => {
                for (handler, result) in handlers {
                    handler(result);
                }
            }
            Publication::Processed { commands, results } => {
                let subscribers: Vec<ProcessedSubscriber> = self
                    .observers
                    .processed
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                for subscriber in subscribers {
                    subscriber(&commands, &results);
                }
            }
        }
    }

    fn notify_node_observers(&self, old: &Snapshot, new: &Snapshot) {
        let changed: Vec<Id> = self
            .observers
            .nodes
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| old.node_differs(new, *id))
            .collect();

        for node_id in changed {
            // Taken out of the map so callbacks can register new observers.
            let Some((_, observers)) = self.observers.nodes.remove(&node_id) else {
                continue;
            };
            let mut kept = Vec::new();
            for mut observer in observers {
                if observer.active.load(Ordering::SeqCst) && (observer.callback)() {
                    kept.push(observer);
                }
            }
            if !kept.is_empty() {
                self.observers.nodes.entry(node_id).or_default().extend(kept);
            }
        }
    }
}

/// Clears the delivering flag if a callback panics mid-delivery, so the
/// next caller can pick up the remaining outbox.
struct DeliveryReset<'a>(&'a TreeCore);

impl Drop for DeliveryReset<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut state = self.0.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.delivering = false;
        }
    }
}

impl std::fmt::Debug for TreeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCore")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
