//! # Reflux
//!
//! A reactive state container: a long-lived store that serializes incoming
//! **intents** into state transitions and one-shot **actions**, through an
//! ordered chain of interceptor **plugins**.
//!
//! ## Core Concepts
//!
//! - **State** = the single current value of the store, replaced on every commit
//! - **Intent** = a request to the store, processed exactly once, in order
//! - **Action** = a side-effect notification for subscribers, never replayed
//! - [`Plugin`] = an interceptor with hooks around everything the store does
//! - [`Reducer`] = turns surviving intents into state updates and actions
//!
//! ## Architecture
//!
//! ```text
//! submit(intent)
//!     │
//!     ▼
//! Intent queue (unbounded, FIFO)
//!     │
//!     ▼ one consumer task per run
//! on_intent chain ── Consumed ──► dropped
//!     │ Forward(intent)
//!     ▼
//! Reducer ──► ctx.update_state(f) ──► on_state chain ──► commit ──► states()
//!     │
//!     ├─────► ctx.emit_action(a) ───► on_action chain ──► actions()
//!     │
//!     └─────► ctx.launch(work) / ctx.launch_job(name, work)
//!
//! errors ──► on_exception chain ──► Recover policy (Log | State | Rethrow)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **FIFO** - Intents are processed one at a time, in submission order
//! 2. **Linearizable state** - Every commit happens under one fair lock
//! 3. **Left-to-right chain** - `Consumed` at plugin k skips plugins k+1..n
//! 4. **Loop survives errors** - Only cancellation or `Rethrow` ends a run
//! 5. **Scoped work** - Launched work and jobs are cancelled when a run stops
//!
//! ## Example
//!
//! ```ignore
//! use reflux::{ActionShareBehavior, PipelineContext, Store};
//! use reflux::plugins::LoggingPlugin;
//!
//! #[derive(Debug, Clone, Default)]
//! struct Counter { value: i64 }
//!
//! #[derive(Debug)]
//! enum CounterIntent { Add(i64), Reset }
//!
//! #[derive(Debug, Clone)]
//! enum CounterAction { Overflowed }
//!
//! let store = Store::builder(Counter::default())
//!     .with_name("counter")
//!     .with_plugin(LoggingPlugin::default())
//!     .with_action_share_behavior(ActionShareBehavior::Share { buffer: 16 })
//!     .reduce(|ctx: PipelineContext<Counter, CounterIntent, CounterAction>, intent| async move {
//!         match intent {
//!             CounterIntent::Add(n) => {
//!                 let next = ctx.update_state(|s| Counter { value: s.value + n }).await?;
//!                 if next.value > 100 {
//!                     ctx.emit_action(CounterAction::Overflowed).await?;
//!                 }
//!             }
//!             CounterIntent::Reset => {
//!                 ctx.update_state(|_| Counter::default()).await?;
//!             }
//!         }
//!         Ok(())
//!     })
//!     .build()?;
//!
//! let run = store.start().await?;
//! store.submit(CounterIntent::Add(5));
//! // ...
//! store.stop().await;
//! ```

mod action;
mod chain;
mod config;
mod context;
mod core;
mod error;
mod job;
mod plugin;
mod reducer;
mod store;

// Built-in plugins
pub mod plugins;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core traits
pub use crate::core::{Action, Flow, Intent, State};

// Re-export error types
pub use crate::error::{is_cancellation, StoreError};

// Re-export store types (primary entry point)
pub use store::{StateSubscription, Store, StoreBuilder, StoreRun, Subscription};

// Re-export pipeline types
pub use context::{PipelineContext, Recover};
pub use plugin::{FnPlugin, Plugin, PluginBuilder};
pub use reducer::{reduce_fn, FnReducer, Reducer};

// Re-export action and job types
pub use action::{ActionShareBehavior, ActionStream, Overflow, DEFAULT_ACTION_BUFFER};
pub use config::{StoreConfig, DEFAULT_STATE_CAPACITY};
pub use job::JobRegistry;

// Re-export commonly used external types
pub use async_trait::async_trait;
