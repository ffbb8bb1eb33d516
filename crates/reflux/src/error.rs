//! Structured error types for reflux.
//!
//! `StoreError` provides pattern-matchable errors for everything the store
//! itself decides (lifecycle, plugin installation, undo/redo availability).
//! Reducers and plugin hooks return `anyhow::Result`; `anyhow` is the
//! internal transport, `StoreError` is what callers match on.
//!
//! # Cancellation
//!
//! [`StoreError::Cancelled`] is special: whenever it reaches the consumer
//! loop or a launched task, it terminates that unit of work. It is never
//! offered to `on_exception` hooks and can't be recovered from.
//!
//! # Example
//!
//! ```ignore
//! match undo_redo.undo(&ctx).await {
//!     Ok(index) => tracing::debug!(?index, "undone"),
//!     Err(e) if matches!(e.downcast_ref(), Some(StoreError::UndoUnavailable)) => {
//!         ctx.emit_action(Action::NothingToUndo).await?;
//!     }
//!     Err(e) => return Err(e),
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// Errors produced by the store runtime.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `start` was called while a previous run is still active.
    #[error("store is already started")]
    AlreadyStarted,

    /// The store was started before and a restart policy forbids another run.
    #[error("store was started before and does not allow restarts")]
    RestartDisallowed,

    /// `undo` was called with no history behind the cursor.
    #[error("nothing to undo")]
    UndoUnavailable,

    /// `redo` was called with the cursor already at the newest event.
    #[error("nothing to redo")]
    RedoUnavailable,

    /// An `on_start` hook failed and the store is configured to abort
    /// the start on the first failure.
    #[error("store failed to start: {0:#}")]
    StartFailed(#[source] anyhow::Error),

    /// Two plugins with the same name were installed.
    #[error("a plugin named '{name}' is already installed")]
    PluginNameConflict { name: String },

    /// An error raised while processing an intent or running launched work.
    #[error("reduction failed: {0:#}")]
    Reduction(#[source] anyhow::Error),

    /// Cooperative cancellation of the current unit of work.
    #[error("cancelled")]
    Cancelled,

    /// The run stopped because an error was left unhandled under
    /// `Recover::Rethrow`.
    #[error("store terminated: {0:#}")]
    Terminated(Arc<anyhow::Error>),
}

impl StoreError {
    /// The error wrapped by [`StoreError::Reduction`], if this is one.
    pub fn reduction_source(&self) -> Option<&anyhow::Error> {
        match self {
            StoreError::Reduction(inner) => Some(inner),
            _ => None,
        }
    }
}

/// Returns `true` if `err` is a cancellation signal.
///
/// Every place that intercepts errors checks this first and lets
/// cancellation through untouched.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Cancelled))
}

/// Wrap an application error in `StoreError::Reduction`.
///
/// Errors that are already `StoreError`s pass through unchanged.
pub(crate) fn into_reduction(err: anyhow::Error) -> anyhow::Error {
    if err.is::<StoreError>() {
        err
    } else {
        anyhow::Error::new(StoreError::Reduction(err))
    }
}
