//! # Counter Demo
//!
//! A counter store exercising every part of reflux:
//!
//! - a timer job, started when a subscriber attaches, feeding `Tick` intents
//! - increments recorded in an undo/redo history
//! - a recover plugin turning failures into an action or an error state
//! - logging, and a store that refuses to restart
//!
//! ```text
//! Loading ──Tick(t)──► DisplayingCounter { timer: t, counter: 0 }
//!                          │ Increment / Undo / Redo
//!                          ▼
//!                      DisplayingCounter { timer, counter ± 1 }
//!                          │ Crash
//!                          ▼
//!                      Error(message)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reflux::plugins::{LoggingPlugin, UndoRedoPlugin, Undoable};
use reflux::{Flow, PipelineContext, PluginBuilder, Store, StoreError};
use thiserror::Error;
use tracing::{debug, warn, Level};

/// Name of the job feeding timer ticks.
pub const TIMER_JOB: &str = "timer";

// ============================================================================
// State, Intents, Actions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterState {
    Loading,
    DisplayingCounter { timer: u32, counter: i64 },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterIntent {
    /// The timer produced a new value.
    Tick(u32),
    Increment,
    Undo,
    Redo,
    Back,
    /// Simulates an unexpected failure.
    Crash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterAction {
    GoBack,
    ShowErrorMessage(String),
}

pub type CounterStore = Store<CounterState, CounterIntent, CounterAction>;
type Ctx = PipelineContext<CounterState, CounterIntent, CounterAction>;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("the counter is not displayed yet")]
    NotReady,

    #[error("the counter crashed")]
    Crashed,
}

// ============================================================================
// Undoable edits
// ============================================================================

/// A reversible change to the counter.
#[derive(Debug, Clone, Copy)]
pub enum CounterEdit {
    Add(i64),
}

impl CounterEdit {
    async fn apply(ctx: &Ctx, delta: i64) -> Result<()> {
        ctx.try_update_state(|state| match state {
            CounterState::DisplayingCounter { timer, counter } => {
                Ok(CounterState::DisplayingCounter {
                    timer: *timer,
                    counter: counter + delta,
                })
            }
            _ => Err(CounterError::NotReady.into()),
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Undoable<CounterState, CounterIntent, CounterAction> for CounterEdit {
    async fn redo(&self, ctx: &Ctx) -> Result<()> {
        let CounterEdit::Add(delta) = *self;
        Self::apply(ctx, delta).await
    }

    async fn undo(&self, ctx: &Ctx) -> Result<()> {
        let CounterEdit::Add(delta) = *self;
        Self::apply(ctx, -delta).await
    }
}

// ============================================================================
// Container
// ============================================================================

#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub name: String,
    /// Interval of the timer job; `None` disables it.
    pub timer_interval: Option<Duration>,
    pub history_size: usize,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            name: "counter".to_string(),
            timer_interval: None,
            history_size: 10,
        }
    }
}

/// The counter store plus the handles its reducer uses.
pub struct CounterContainer {
    pub store: CounterStore,
    pub history: Arc<UndoRedoPlugin<CounterEdit>>,
}

impl CounterContainer {
    pub fn new(config: CounterConfig) -> Result<Self, StoreError> {
        let history = Arc::new(UndoRedoPlugin::new(config.history_size));

        let store = Store::builder(CounterState::Loading)
            .with_name(config.name.clone())
            .with_plugin(LoggingPlugin::new(Level::DEBUG))
            .disallow_restart()
            .with_shared_plugin(history.clone())
            .with_plugin(timer_plugin(config.timer_interval))
            .with_plugin(recover_plugin(history.clone()))
            .with_reducer(CounterReducer {
                history: history.clone(),
            })
            .build()?;

        Ok(Self { store, history })
    }
}

struct CounterReducer {
    history: Arc<UndoRedoPlugin<CounterEdit>>,
}

#[async_trait]
impl reflux::Reducer<CounterState, CounterIntent, CounterAction> for CounterReducer {
    async fn reduce(&self, ctx: &Ctx, intent: CounterIntent) -> Result<()> {
        match intent {
            CounterIntent::Tick(timer) => {
                ctx.update_state(|state| produce_state(state, timer)).await?;
            }
            CounterIntent::Increment => {
                self.history.invoke(ctx, CounterEdit::Add(1), true).await?;
            }
            CounterIntent::Undo => {
                self.history.undo(ctx).await?;
            }
            CounterIntent::Redo => {
                self.history.redo(ctx).await?;
            }
            CounterIntent::Back => ctx.emit_action(CounterAction::GoBack).await?,
            CounterIntent::Crash => return Err(CounterError::Crashed.into()),
        }
        Ok(())
    }
}

/// Merge a timer value into the current state, keeping the counter.
fn produce_state(current: &CounterState, timer: u32) -> CounterState {
    let counter = match current {
        CounterState::DisplayingCounter { counter, .. } => *counter,
        _ => 0,
    };
    CounterState::DisplayingCounter { timer, counter }
}

/// Starts the timer job whenever a subscriber attaches.
fn timer_plugin(
    interval: Option<Duration>,
) -> reflux::FnPlugin<CounterState, CounterIntent, CounterAction> {
    PluginBuilder::new("timer").on_subscribe(move |ctx: Ctx, _subscribers| async move {
        let Some(interval) = interval else {
            return Ok(());
        };
        let ticker = ctx.clone();
        ctx.launch_job(TIMER_JOB, async move {
            let mut ticks = tokio::time::interval(interval);
            let mut timer = 0u32;
            while ticker.is_active() {
                ticks.tick().await;
                ticker.submit(CounterIntent::Tick(timer));
                timer = timer.wrapping_add(1);
            }
            Ok(())
        })
        .await;
        Ok(())
    })
    .build()
}

/// Expected failures become a message, anything else an error state.
fn recover_plugin(
    history: Arc<UndoRedoPlugin<CounterEdit>>,
) -> reflux::FnPlugin<CounterState, CounterIntent, CounterAction> {
    PluginBuilder::new("recover")
        .on_exception(move |ctx: Ctx, error| {
            let history = history.clone();
            async move {
                if let Some(message) = user_facing(&error) {
                    debug!(error = %error, "showing error message");
                    if let Err(emit_error) = ctx
                        .emit_action(CounterAction::ShowErrorMessage(message))
                        .await
                    {
                        warn!(error = %emit_error, "failed to show error message");
                    }
                    return Flow::Consumed;
                }

                history.reset().await;
                ctx.cancel_job(TIMER_JOB);
                let message = format!("{error:#}");
                if let Err(update_error) = ctx
                    .update_state(move |_| CounterState::Error(message))
                    .await
                {
                    return Flow::Forward(update_error);
                }
                Flow::Consumed
            }
        })
        .build()
}

/// A message for failures the user can fix.
fn user_facing(error: &anyhow::Error) -> Option<String> {
    let store_error = error.downcast_ref::<StoreError>();
    match store_error {
        Some(StoreError::UndoUnavailable) | Some(StoreError::RedoUnavailable) => {
            return store_error.map(ToString::to_string);
        }
        _ => {}
    }

    let counter_error = store_error
        .and_then(StoreError::reduction_source)
        .and_then(|source| source.downcast_ref::<CounterError>())
        .or_else(|| error.downcast_ref::<CounterError>());
    match counter_error {
        Some(CounterError::NotReady) => Some(CounterError::NotReady.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_state_keeps_counter() {
        let current = CounterState::DisplayingCounter {
            timer: 1,
            counter: 7,
        };
        assert_eq!(
            produce_state(&current, 2),
            CounterState::DisplayingCounter {
                timer: 2,
                counter: 7
            }
        );
        assert_eq!(
            produce_state(&CounterState::Loading, 3),
            CounterState::DisplayingCounter {
                timer: 3,
                counter: 0
            }
        );
    }

    #[test]
    fn test_user_facing_errors() {
        let undo: anyhow::Error = StoreError::UndoUnavailable.into();
        assert_eq!(user_facing(&undo).as_deref(), Some("nothing to undo"));

        let not_ready: anyhow::Error =
            StoreError::Reduction(CounterError::NotReady.into()).into();
        assert!(user_facing(&not_ready).is_some());

        let crashed: anyhow::Error = StoreError::Reduction(CounterError::Crashed.into()).into();
        assert!(user_facing(&crashed).is_none());
    }
}
