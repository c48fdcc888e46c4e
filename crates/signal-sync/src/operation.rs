//! Caller-facing handles for the eventual outcome of a tree mutation.
//!
//! A [`SignalOperation`] is created unresolved when a mutation is requested
//! and resolved exactly once when the command is confirmed. Callers can poll
//! it, attach a callback, or `wait()` for it from async code. A caller that
//! wants a timeout races `wait()` against `tokio::time::timeout` and simply
//! ignores a late resolution.
//!
//! The side that will eventually resolve an operation holds a [`Resolver`].
//! If the last resolver is dropped first (for example because the tree that
//! queued the command was dropped), the operation resolves with
//! `"Operation abandoned"` so that nobody waits forever.

use crate::error::{Result, SignalError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// Eventual outcome of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultOrError<T> {
    Value(T),
    Error(String),
}

impl<T> ResultOrError<T> {
    pub fn successful(&self) -> bool {
        matches!(self, ResultOrError::Value(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            ResultOrError::Value(value) => Some(value),
            ResultOrError::Error(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ResultOrError::Value(_) => None,
            ResultOrError::Error(reason) => Some(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ResultOrError<U> {
        match self {
            ResultOrError::Value(value) => ResultOrError::Value(f(value)),
            ResultOrError::Error(reason) => ResultOrError::Error(reason),
        }
    }
}

type Listener<T> = Box<dyn FnOnce(&ResultOrError<T>) + Send>;

struct Slot<T> {
    result: Option<ResultOrError<T>>,
    listeners: Vec<Listener<T>>,
}

/// Single-assignment handle for the result of one operation.
pub struct SignalOperation<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for SignalOperation<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<T> Default for SignalOperation<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot { result: None, listeners: Vec::new() })),
        }
    }
}

impl<T: Clone + Send + 'static> SignalOperation<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an operation that is already resolved.
    pub fn resolved(result: ResultOrError<T>) -> Self {
        let operation = Self::new();
        operation.lock().result = Some(result);
        operation
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the result and runs the completion callbacks.
    ///
    /// Returns [`SignalError::AlreadyResolved`] if a result was already set;
    /// the first result is kept.
    pub fn resolve(&self, result: ResultOrError<T>) -> Result<()> {
        let listeners = {
            let mut slot = self.lock();
            if slot.result.is_some() {
                return Err(SignalError::AlreadyResolved);
            }
            slot.result = Some(result.clone());
            std::mem::take(&mut slot.listeners)
        };

        for listener in listeners {
            listener(&result);
        }
        Ok(())
    }

    pub fn result(&self) -> Option<ResultOrError<T>> {
        self.lock().result.clone()
    }

    pub fn is_done(&self) -> bool {
        self.lock().result.is_some()
    }

    /// Runs `callback` with the result, immediately if it is already known.
    pub fn on_complete(&self, callback: impl FnOnce(&ResultOrError<T>) + Send + 'static) {
        let mut slot = self.lock();
        if let Some(result) = slot.result.clone() {
            drop(slot);
            callback(&result);
        } else {
            slot.listeners.push(Box::new(callback));
        }
    }

    /// Handle that resolves this operation, or abandons it when dropped
    /// unresolved.
    pub fn resolver(&self) -> Resolver<T> {
        Resolver { operation: self.clone() }
    }

    /// Waits for the result.
    pub async fn wait(&self) -> ResultOrError<T> {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |result| {
            let _ = tx.send(result.clone());
        });
        rx.await
            .unwrap_or_else(|_| ResultOrError::Error("Operation abandoned".to_string()))
    }

    /// Derived operation resolved with `f(value)` on success, or with the
    /// same reason on failure.
    pub fn map<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> SignalOperation<U> {
        let mapped = SignalOperation::new();
        let target = mapped.clone();
        self.on_complete(move |result| {
            // `target` is private to this closure, so it cannot be resolved twice.
            let _ = target.resolve(result.clone().map(f));
        });
        mapped
    }
}

impl<T: fmt::Debug> fmt::Debug for SignalOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SignalOperation")
            .field("result", &slot.result)
            .finish_non_exhaustive()
    }
}

/// Resolving side of a [`SignalOperation`].
///
/// Dropping a resolver that has not resolved its operation resolves it with
/// `"Operation abandoned"`.
pub struct Resolver<T: Clone + Send + 'static> {
    operation: SignalOperation<T>,
}

impl<T: Clone + Send + 'static> Resolver<T> {
    pub fn resolve(&self, result: ResultOrError<T>) -> Result<()> {
        self.operation.resolve(result)
    }
}

impl<T: Clone + Send + 'static> Drop for Resolver<T> {
    fn drop(&mut self) {
        if !self.operation.is_done() {
            // Losing a race with a concurrent resolve is fine.
            let _ = self
                .operation
                .resolve(ResultOrError::Error("Operation abandoned".to_string()));
        }
    }
}

/// Operation whose caller can withdraw interest in the outcome.
///
/// Cancellation is advisory: a command that was already submitted may still
/// be confirmed, and the operation then resolves normally. Operations derived
/// with [`map`](Self::map) share the cancellation state of their source, so
/// cancelling either cancels both.
pub struct CancelableOperation<T> {
    operation: SignalOperation<T>,
    source_cancelled: Arc<AtomicBool>,
}

impl<T> Clone for CancelableOperation<T> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            source_cancelled: self.source_cancelled.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> CancelableOperation<T> {
    pub fn new() -> Self {
        Self {
            operation: SignalOperation::new(),
            source_cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn operation(&self) -> &SignalOperation<T> {
        &self.operation
    }

    pub fn cancel(&self) {
        self.source_cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.source_cancelled.load(Ordering::SeqCst)
    }

    pub fn resolve(&self, result: ResultOrError<T>) -> Result<()> {
        self.operation.resolve(result)
    }

    pub fn resolver(&self) -> Resolver<T> {
        self.operation.resolver()
    }

    pub fn result(&self) -> Option<ResultOrError<T>> {
        self.operation.result()
    }

    pub fn is_done(&self) -> bool {
        self.operation.is_done()
    }

    pub fn on_complete(&self, callback: impl FnOnce(&ResultOrError<T>) + Send + 'static) {
        self.operation.on_complete(callback)
    }

    pub async fn wait(&self) -> ResultOrError<T> {
        self.operation.wait().await
    }

    pub fn map<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> CancelableOperation<U> {
        CancelableOperation {
            operation: self.operation.map(f),
            source_cancelled: self.source_cancelled.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for CancelableOperation<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for CancelableOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelableOperation")
            .field("operation", &self.operation)
            .field("cancelled", &self.source_cancelled.load(Ordering::SeqCst))
            .finish()
    }
}
