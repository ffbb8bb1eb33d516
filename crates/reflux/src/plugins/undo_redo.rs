//! Undo/redo history for a store.
//!
//! Undoable work is described by command values implementing [`Undoable`].
//! [`UndoRedoPlugin`] keeps a capped, linear history of them plus a cursor:
//!
//! ```text
//!  events:  [e0] [e1] [e2] [e3]
//!                      ▲
//!                    index          (None = nothing to undo)
//!
//!  undo()  → runs e2.undo, index moves to e1
//!  redo()  → runs e3.redo, index moves to e3
//!  invoke  → drops e3, appends the new event, index moves to it
//! ```
//!
//! # Locking
//!
//! `invoke`, `undo` and `redo` share one history lock and hold it while the
//! command runs, so the history lock is acquired before the state lock.
//! Commands must not call back into the plugin, and `on_state` hooks must
//! not call `undo`/`redo`.
//!
//! # Capacity
//!
//! When an append exceeds the capacity, the oldest event is evicted. The
//! cursor always ends on the appended event, so eviction never leaves it
//! pointing at a dropped slot.
//!
//! # Runs
//!
//! The history is cleared on every start and stop: commands recorded during
//! one run are never replayed against a later one.
//!
//! # Example
//!
//! ```ignore
//! let history = Arc::new(UndoRedoPlugin::<CounterEdit>::new(10));
//! let store = Store::builder(Counter::default())
//!     .with_shared_plugin(history.clone())
//!     .reduce(move |ctx, intent| {
//!         let history = history.clone();
//!         async move {
//!             match intent {
//!                 Intent::Increment => { history.invoke(&ctx, CounterEdit::Add(1), true).await?; }
//!                 Intent::Undo => { history.undo(&ctx).await?; }
//!             }
//!             Ok(())
//!         }
//!     })
//!     .build()?;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::context::PipelineContext;
use crate::core::{Action, Intent, State};
use crate::error::StoreError;
use crate::plugin::Plugin;

/// Default name of [`UndoRedoPlugin`].
pub const UNDO_REDO_PLUGIN_NAME: &str = "undo-redo";

/// A reversible command recorded by [`UndoRedoPlugin`].
#[async_trait]
pub trait Undoable<S, I, A>: Send + Sync + 'static
where
    S: State,
    I: Intent,
    A: Action,
{
    /// Apply the command.
    async fn redo(&self, ctx: &PipelineContext<S, I, A>) -> Result<()>;

    /// Revert the command.
    async fn undo(&self, ctx: &PipelineContext<S, I, A>) -> Result<()>;
}

struct History<E> {
    events: VecDeque<E>,
    index: Option<usize>,
}

impl<E> History<E> {
    fn last_index(&self) -> Option<usize> {
        self.events.len().checked_sub(1)
    }

    fn can_redo(&self) -> bool {
        self.index != self.last_index()
    }
}

/// Plugin keeping a capped undo/redo history of `E` commands.
///
/// Keep an `Arc` to the plugin (install it with
/// `StoreBuilder::with_shared_plugin`) to call its methods.
pub struct UndoRedoPlugin<E> {
    name: String,
    capacity: usize,
    history: Mutex<History<E>>,
    index: watch::Sender<Option<usize>>,
    size: AtomicUsize,
}

impl<E> UndoRedoPlugin<E> {
    /// Create a plugin keeping at most `capacity` events (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: UNDO_REDO_PLUGIN_NAME.to_string(),
            capacity,
            history: Mutex::new(History {
                events: VecDeque::with_capacity(capacity),
                index: None,
            }),
            index: watch::Sender::new(None),
            size: AtomicUsize::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current cursor. `None` means there is nothing to undo.
    pub fn index(&self) -> Option<usize> {
        *self.index.borrow()
    }

    /// Observe cursor changes.
    pub fn watch_index(&self) -> watch::Receiver<Option<usize>> {
        self.index.subscribe()
    }

    /// Number of recorded events, regardless of the cursor.
    pub fn queue_size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue_size() == 0
    }

    pub fn can_undo(&self) -> bool {
        self.index().is_some()
    }

    pub fn can_redo(&self) -> bool {
        let size = self.queue_size();
        match self.index() {
            Some(index) => index + 1 < size,
            None => size > 0,
        }
    }

    /// Clear the history and reset the cursor.
    pub async fn reset(&self) {
        let mut history = self.history.lock().await;
        history.events.clear();
        history.index = None;
        self.publish(&history);
    }

    fn publish(&self, history: &History<E>) {
        self.size.store(history.events.len(), Ordering::Release);
        self.index.send_replace(history.index);
    }

    /// Record `event`, running its `redo` first when `do_immediately`.
    ///
    /// Events after the cursor are discarded. If the immediate `redo` fails
    /// nothing is recorded. Returns the new cursor.
    pub async fn invoke<S, I, A>(
        &self,
        ctx: &PipelineContext<S, I, A>,
        event: E,
        do_immediately: bool,
    ) -> Result<usize>
    where
        S: State,
        I: Intent,
        A: Action,
        E: Undoable<S, I, A>,
    {
        let mut history = self.history.lock().await;
        if do_immediately {
            event.redo(ctx).await?;
        }

        let keep = history.index.map_or(0, |index| index + 1);
        history.events.truncate(keep);
        history.events.push_back(event);
        if history.events.len() > self.capacity {
            history.events.pop_front();
            debug!(plugin = %self.name, "history full, evicted oldest event");
        }

        let index = history.events.len() - 1;
        history.index = Some(index);
        self.publish(&history);
        Ok(index)
    }

    /// Revert the event at the cursor and move the cursor back.
    ///
    /// Fails with [`StoreError::UndoUnavailable`] when there is nothing to
    /// undo, leaving the history untouched. Returns the new cursor.
    pub async fn undo<S, I, A>(&self, ctx: &PipelineContext<S, I, A>) -> Result<Option<usize>>
    where
        S: State,
        I: Intent,
        A: Action,
        E: Undoable<S, I, A>,
    {
        let mut history = self.history.lock().await;
        let Some(index) = history.index else {
            return Err(StoreError::UndoUnavailable.into());
        };
        if let Some(event) = history.events.get(index) {
            event.undo(ctx).await?;
        }

        history.index = index.checked_sub(1);
        self.publish(&history);
        Ok(history.index)
    }

    /// Move the cursor forward and re-apply the event there.
    ///
    /// Fails with [`StoreError::RedoUnavailable`] when the cursor is on the
    /// newest event. Returns the new cursor.
    pub async fn redo<S, I, A>(&self, ctx: &PipelineContext<S, I, A>) -> Result<usize>
    where
        S: State,
        I: Intent,
        A: Action,
        E: Undoable<S, I, A>,
    {
        let mut history = self.history.lock().await;
        if !history.can_redo() {
            return Err(StoreError::RedoUnavailable.into());
        }
        let next = history.index.map_or(0, |index| index + 1);
        if let Some(event) = history.events.get(next) {
            event.redo(ctx).await?;
        }

        history.index = Some(next);
        self.publish(&history);
        Ok(next)
    }
}

#[async_trait]
impl<S, I, A, E> Plugin<S, I, A> for UndoRedoPlugin<E>
where
    S: State,
    I: Intent,
    A: Action,
    E: Undoable<S, I, A>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&self, _ctx: &PipelineContext<S, I, A>) -> Result<()> {
        self.reset().await;
        Ok(())
    }

    async fn on_stop(&self, _error: Option<&anyhow::Error>) {
        self.reset().await;
    }
}

impl<E> std::fmt::Debug for UndoRedoPlugin<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoRedoPlugin")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("index", &self.index())
            .field("queue_size", &self.queue_size())
            .finish()
    }
}
