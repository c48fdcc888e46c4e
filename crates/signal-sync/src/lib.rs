//! # Signal Sync
//!
//! A tree of shared state cells that is mutated locally with immediate,
//! optimistic effect while an external ordering authority decides what
//! really happened.
//!
//! ## Core Concepts
//!
//! Every tree keeps two snapshots:
//! - **confirmed** = effects of commands the authority has confirmed, in its order
//! - **submitted** = confirmed plus every local command still in flight
//!
//! Readers never see a torn view: both snapshots are immutable and swapped
//! under the tree lock.
//!
//! ## Architecture
//!
//! ```text
//! Caller
//!     │
//!     ▼ commit(commands)
//! SignalTree ─── submitted' = submitted + commands ───► observers
//!     │                                                   ▲
//!     ▼ submit()                                          │
//! CommandSubmitter ──► authority (log, cluster, worker)   │
//!                             │                           │
//!                             ▼ confirm(ordered batch)    │
//!                      AsynchronousSignalTree ────────────┤
//!                             │                           │
//!                             ├─► confirmed' = confirmed + batch
//!                             ├─► rebuild submitted unless the batch
//!                             │   was the head of the pending queue
//!                             └─► resolve SignalOperation handles
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Confirmed is authoritative** - only confirmed commands, applied in confirmation order
//! 2. **Submitted replays the queue** - confirmed plus pending commands in local submission order
//! 3. **The queue is never reordered** - entries only leave when a result for them is confirmed
//! 4. **Handles resolve once** - a `SignalOperation` result never changes
//! 5. **Callbacks run outside the lock** - in the order the lock serialized them
//!
//! ## Example
//!
//! ```ignore
//! use signal_sync::{AsynchronousSignalTree, SignalTree, TreeConfig, ValueSignal};
//! use std::sync::Arc;
//!
//! let tree = AsynchronousSignalTree::local(TreeConfig::default())?;
//! let counter = ValueSignal::<f64>::root(tree.clone());
//!
//! counter.set(1.0)?;
//! assert_eq!(counter.value()?, Some(1.0));    // visible right away
//!
//! let previous = counter.update(|value| value.unwrap_or_default() + 1.0)?;
//! previous.wait().await;                       // confirmed by the worker
//! ```
//!
//! ## What This Is Not
//!
//! - A transport: the authority behind [`CommandSubmitter`] is yours to provide
//! - A conflict resolver: accept/reject comes from applying the command
//! - A persistence format: [`TreeImage`] is a convenience, not a log

// Core modules
mod command;
mod config;
mod error;
mod id;
mod node;
mod operation;
mod pending;
mod result;
mod revision;
mod signal;
mod snapshot;

// Trees and the commit protocol
pub mod tree;


// Re-export data model
pub use command::{CommandPayload, KeyExpectation, ListPosition, SignalCommand};
pub use id::Id;
pub use result::CommandResult;
pub use snapshot::{NodeData, Snapshot};

// Re-export snapshot building
pub use revision::TreeRevisionBuilder;

// Re-export pending queue types
pub use pending::{CommandsAndHandlers, ResultHandler};

// Re-export operation handles
pub use operation::{CancelableOperation, Resolver, ResultOrError, SignalOperation};

// Re-export tree types
pub use tree::{
    AsynchronousSignalTree, CommandSubmitter, PendingCommit, SignalTree, Subscription,
    SynchronousSignalTree, TreeCore, TreeImage, TreeState,
};

// Re-export typed signals
pub use node::{InsertOperation, NodeSignal};
pub use signal::ValueSignal;

// Re-export configuration and error types
pub use config::TreeConfig;
pub use error::{Result, SignalError};
