//! Reducer trait.
//!
//! The reducer receives every intent that survives the plugin chain. It does
//! not return a new state; it drives the store through the
//! [`PipelineContext`] (update state, emit actions, launch work), which
//! keeps every state transition behind the same lock and the same
//! `on_state` hooks.

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::PipelineContext;
use crate::core::{Action, Intent, State};

/// Processes intents that reach the end of the plugin chain.
///
/// Errors returned from `reduce` are routed through the store's
/// `on_exception` hooks and recover policy; the consumer loop keeps running.
#[async_trait]
pub trait Reducer<S, I, A>: Send + Sync + 'static
where
    S: State,
    I: Intent,
    A: Action,
{
    async fn reduce(&self, ctx: &PipelineContext<S, I, A>, intent: I) -> Result<()>;
}

/// A reducer backed by an async closure. See [`reduce_fn`].
pub struct FnReducer<F> {
    f: F,
}

/// Adapt an async closure into a [`Reducer`].
///
/// ```ignore
/// let store = Store::builder(Counter::default())
///     .with_reducer(reduce_fn(|ctx: Ctx, intent: CounterIntent| async move {
///         match intent {
///             CounterIntent::Increment => {
///                 ctx.update_state(|s| Counter { value: s.value + 1 }).await?;
///             }
///         }
///         Ok(())
///     }))
///     .build()?;
/// ```
pub fn reduce_fn<F>(f: F) -> FnReducer<F> {
    FnReducer { f }
}

#[async_trait]
impl<S, I, A, F, Fut> Reducer<S, I, A> for FnReducer<F>
where
    S: State,
    I: Intent,
    A: Action,
    F: Fn(PipelineContext<S, I, A>, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn reduce(&self, ctx: &PipelineContext<S, I, A>, intent: I) -> Result<()> {
        (self.f)(ctx.clone(), intent).await
    }
}
