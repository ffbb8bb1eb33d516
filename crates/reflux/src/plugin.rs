//! Plugin trait and closure-based plugin builder.
//!
//! Plugins intercept everything that flows through a store. Each hook has a
//! default that passes values through untouched, so a plugin only overrides
//! what it cares about.
//!
//! # Hooks
//!
//! | Hook           | Kind                  | Called                                        |
//! |----------------|-----------------------|-----------------------------------------------|
//! | `on_start`     | side effect           | once per run, insertion order                 |
//! | `on_intent`    | transform / consume   | for every dequeued intent                     |
//! | `on_state`     | transform / veto      | for every state transition, before commit     |
//! | `on_action`    | transform / consume   | for every emitted action                      |
//! | `on_exception` | transform / recover   | for every unhandled error                     |
//! | `on_subscribe` | side effect           | when a subscriber attaches to a running store |
//! | `on_stop`      | teardown              | once per run, reverse insertion order         |
//!
//! # Locking
//!
//! `on_state` runs while the state lock is held. Calling
//! [`PipelineContext::update_state`] or [`PipelineContext::with_state`] from
//! inside it deadlocks; use [`PipelineContext::launch`] to defer that work.

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::context::PipelineContext;
use crate::core::{Action, Flow, Intent, State};

/// An interceptor installed into a store's plugin chain.
///
/// Plugins are identified by [`name`](Plugin::name); a store rejects two
/// plugins with the same name.
///
/// # Example
///
/// ```ignore
/// struct DropEmptySearches;
///
/// #[async_trait]
/// impl Plugin<SearchState, SearchIntent, SearchAction> for DropEmptySearches {
///     fn name(&self) -> &str {
///         "drop-empty-searches"
///     }
///
///     async fn on_intent(&self, _ctx: &Ctx, intent: SearchIntent) -> Result<Flow<SearchIntent>> {
///         match &intent {
///             SearchIntent::Query(q) if q.trim().is_empty() => Ok(Flow::Consumed),
///             _ => Ok(Flow::Forward(intent)),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Plugin<S, I, A>: Send + Sync + 'static
where
    S: State,
    I: Intent,
    A: Action,
{
    /// Unique name of this plugin within a store.
    fn name(&self) -> &str;

    /// Called when the store starts a run, before any intent is processed.
    async fn on_start(&self, _ctx: &PipelineContext<S, I, A>) -> Result<()> {
        Ok(())
    }

    /// Transform or consume an intent before it reaches the reducer.
    async fn on_intent(&self, _ctx: &PipelineContext<S, I, A>, intent: I) -> Result<Flow<I>> {
        Ok(Flow::Forward(intent))
    }

    /// Transform or veto a state transition from `old` to `new`.
    async fn on_state(&self, _ctx: &PipelineContext<S, I, A>, _old: &S, new: S) -> Result<Flow<S>> {
        Ok(Flow::Forward(new))
    }

    /// Transform or consume an action before it is distributed.
    async fn on_action(&self, _ctx: &PipelineContext<S, I, A>, action: A) -> Result<Flow<A>> {
        Ok(Flow::Forward(action))
    }

    /// Handle an error. Return `Flow::Consumed` once it is fully recovered,
    /// or forward it (possibly transformed) to the next plugin.
    async fn on_exception(
        &self,
        _ctx: &PipelineContext<S, I, A>,
        error: anyhow::Error,
    ) -> Flow<anyhow::Error> {
        Flow::Forward(error)
    }

    /// Called when a subscriber attaches while the store is running.
    async fn on_subscribe(
        &self,
        _ctx: &PipelineContext<S, I, A>,
        _subscriber_count: usize,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when a run ends. `error` is the terminal error if the run
    /// stopped abnormally, `None` on a clean stop.
    async fn on_stop(&self, _error: Option<&anyhow::Error>) {}
}

// =============================================================================
// Closure-based plugins
// =============================================================================

type StartHook<S, I, A> =
    Box<dyn Fn(PipelineContext<S, I, A>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type IntentHook<S, I, A> =
    Box<dyn Fn(PipelineContext<S, I, A>, I) -> BoxFuture<'static, Result<Flow<I>>> + Send + Sync>;
type StateHook<S, I, A> = Box<
    dyn Fn(PipelineContext<S, I, A>, S, S) -> BoxFuture<'static, Result<Flow<S>>> + Send + Sync,
>;
type ActionHook<S, I, A> =
    Box<dyn Fn(PipelineContext<S, I, A>, A) -> BoxFuture<'static, Result<Flow<A>>> + Send + Sync>;
type ExceptionHook<S, I, A> = Box<
    dyn Fn(PipelineContext<S, I, A>, anyhow::Error) -> BoxFuture<'static, Flow<anyhow::Error>>
        + Send
        + Sync,
>;
type SubscribeHook<S, I, A> =
    Box<dyn Fn(PipelineContext<S, I, A>, usize) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type StopHook = Box<dyn Fn(Option<&anyhow::Error>) + Send + Sync>;

/// Builder for plugins made of closures.
///
/// ```ignore
/// let audit = PluginBuilder::new("audit")
///     .on_intent(|_ctx, intent: CounterIntent| async move {
///         tracing::info!(?intent, "intent received");
///         Ok(Flow::Forward(intent))
///     })
///     .on_stop(|error| tracing::info!(failed = error.is_some(), "store stopped"))
///     .build();
/// ```
pub struct PluginBuilder<S, I, A> {
    name: String,
    on_start: Option<StartHook<S, I, A>>,
    on_intent: Option<IntentHook<S, I, A>>,
    on_state: Option<StateHook<S, I, A>>,
    on_action: Option<ActionHook<S, I, A>>,
    on_exception: Option<ExceptionHook<S, I, A>>,
    on_subscribe: Option<SubscribeHook<S, I, A>>,
    on_stop: Option<StopHook>,
}

impl<S: State, I: Intent, A: Action> PluginBuilder<S, I, A> {
    /// Start building a plugin with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_start: None,
            on_intent: None,
            on_state: None,
            on_action: None,
            on_exception: None,
            on_subscribe: None,
            on_stop: None,
        }
    }

    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PipelineContext<S, I, A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_start = Some(Box::new(move |ctx| hook(ctx).boxed()));
        self
    }

    pub fn on_intent<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PipelineContext<S, I, A>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow<I>>> + Send + 'static,
    {
        self.on_intent = Some(Box::new(move |ctx, intent| hook(ctx, intent).boxed()));
        self
    }

    /// The hook receives owned copies of the old and the proposed new state.
    pub fn on_state<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PipelineContext<S, I, A>, S, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow<S>>> + Send + 'static,
    {
        self.on_state = Some(Box::new(move |ctx, old, new| hook(ctx, old, new).boxed()));
        self
    }

    pub fn on_action<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PipelineContext<S, I, A>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow<A>>> + Send + 'static,
    {
        self.on_action = Some(Box::new(move |ctx, action| hook(ctx, action).boxed()));
        self
    }

    pub fn on_exception<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PipelineContext<S, I, A>, anyhow::Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Flow<anyhow::Error>> + Send + 'static,
    {
        self.on_exception = Some(Box::new(move |ctx, error| hook(ctx, error).boxed()));
        self
    }

    pub fn on_subscribe<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PipelineContext<S, I, A>, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_subscribe = Some(Box::new(move |ctx, count| hook(ctx, count).boxed()));
        self
    }

    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&anyhow::Error>) + Send + Sync + 'static,
    {
        self.on_stop = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> FnPlugin<S, I, A> {
        FnPlugin { hooks: self }
    }
}

/// A plugin assembled by [`PluginBuilder`].
pub struct FnPlugin<S, I, A> {
    hooks: PluginBuilder<S, I, A>,
}

#[async_trait]
impl<S: State, I: Intent, A: Action> Plugin<S, I, A> for FnPlugin<S, I, A> {
    fn name(&self) -> &str {
        &self.hooks.name
    }

    async fn on_start(&self, ctx: &PipelineContext<S, I, A>) -> Result<()> {
        match &self.hooks.on_start {
            Some(hook) => hook(ctx.clone()).await,
            None => Ok(()),
        }
    }

    async fn on_intent(&self, ctx: &PipelineContext<S, I, A>, intent: I) -> Result<Flow<I>> {
        match &self.hooks.on_intent {
            Some(hook) => hook(ctx.clone(), intent).await,
            None => Ok(Flow::Forward(intent)),
        }
    }

    async fn on_state(&self, ctx: &PipelineContext<S, I, A>, old: &S, new: S) -> Result<Flow<S>> {
        match &self.hooks.on_state {
            Some(hook) => hook(ctx.clone(), old.clone(), new).await,
            None => Ok(Flow::Forward(new)),
        }
    }

    async fn on_action(&self, ctx: &PipelineContext<S, I, A>, action: A) -> Result<Flow<A>> {
        match &self.hooks.on_action {
            Some(hook) => hook(ctx.clone(), action).await,
            None => Ok(Flow::Forward(action)),
        }
    }

    async fn on_exception(
        &self,
        ctx: &PipelineContext<S, I, A>,
        error: anyhow::Error,
    ) -> Flow<anyhow::Error> {
        match &self.hooks.on_exception {
            Some(hook) => hook(ctx.clone(), error).await,
            None => Flow::Forward(error),
        }
    }

    async fn on_subscribe(
        &self,
        ctx: &PipelineContext<S, I, A>,
        subscriber_count: usize,
    ) -> Result<()> {
        match &self.hooks.on_subscribe {
            Some(hook) => hook(ctx.clone(), subscriber_count).await,
            None => Ok(()),
        }
    }

    async fn on_stop(&self, error: Option<&anyhow::Error>) {
        if let Some(hook) = &self.hooks.on_stop {
            hook(error);
        }
    }
}

impl<S, I, A> std::fmt::Debug for FnPlugin<S, I, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnPlugin")
            .field("name", &self.hooks.name)
            .finish_non_exhaustive()
    }
}
