//! The store: composition, consumer loop and lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//!            start()                on_start ok
//!   Idle ───────────► Starting ─────────────────► Running
//!    ▲                   │ on_start failed           │ stop() / Rethrow / cancel
//!    │                   ▼                           ▼
//!    │                Stopped ◄───────────────── teardown
//!    └──── start() ──────┘                           │ DisallowRestartPlugin
//!                                                    ▼
//!                                                  Closed
//! ```
//!
//! Each start creates a new run with its own id, cancellation token and
//! task tracker. Intents submitted while no run is active are buffered and
//! processed by the next run; a closed store drops them.
//!
//! # Consumer Loop
//!
//! One task per run dequeues intents in FIFO order and processes each one
//! to completion before the next: `on_intent` chain, then the reducer.
//! Errors go through the exception path (see [`PipelineContext`]). Only
//! cancellation or an unhandled error under `Recover::Rethrow` ends the
//! loop.
//!
//! # Teardown
//!
//! 1. Cancel the run token (consumer, launched work)
//! 2. Abort and await every registered job
//! 3. Wait for launched work to finish
//! 4. Drop intents still queued, logging how many
//! 5. Run `on_stop` hooks in reverse order with the terminal error
//!
//! `stop()` returns after teardown has completed.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::stream::{self, Stream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{ActionChannel, ActionShareBehavior, ActionStream};
use crate::chain::{PluginChain, SharedPlugin};
use crate::config::StoreConfig;
use crate::context::{Exit, Lifecycle, PipelineContext, Recover, RunScope, StoreCore};
use crate::core::{lock_unpoisoned, Action, Intent, State};
use crate::error::{is_cancellation, StoreError};
use crate::job::JobRegistry;
use crate::plugin::Plugin;
use crate::plugins::{DisallowRestartPlugin, DISALLOW_RESTART_PLUGIN_NAME};
use crate::reducer::{reduce_fn, Reducer};

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Store`].
///
/// ```ignore
/// let store = Store::builder(CounterState::Loading)
///     .with_name("counter")
///     .with_action_share_behavior(ActionShareBehavior::Share { buffer: 16 })
///     .with_plugin(LoggingPlugin::default())
///     .disallow_restart()
///     .reduce(|ctx, intent| async move { /* ... */ Ok(()) })
///     .recover_with(|error, _state| CounterState::Error(error.to_string()))
///     .build()?;
/// ```
pub struct StoreBuilder<S, I, A> {
    initial: S,
    config: StoreConfig,
    plugins: Vec<SharedPlugin<S, I, A>>,
    reducer: Option<Arc<dyn Reducer<S, I, A>>>,
    recover: Recover<S>,
}

impl<S: State, I: Intent, A: Action> StoreBuilder<S, I, A> {
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            config: StoreConfig::default(),
            plugins: Vec::new(),
            reducer: None,
            recover: Recover::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Replace the whole plain-data configuration.
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_action_share_behavior(mut self, behavior: ActionShareBehavior) -> Self {
        self.config.action_share_behavior = behavior;
        self
    }

    pub fn with_state_capacity(mut self, capacity: usize) -> Self {
        self.config.state_capacity = capacity;
        self
    }

    pub fn abort_on_start_failure(mut self, abort: bool) -> Self {
        self.config.abort_on_start_failure = abort;
        self
    }

    /// Append a plugin to the chain.
    pub fn with_plugin<P: Plugin<S, I, A>>(mut self, plugin: P) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Append a plugin the caller keeps a handle to.
    pub fn with_shared_plugin<P: Plugin<S, I, A>>(mut self, plugin: Arc<P>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_reducer<R: Reducer<S, I, A>>(mut self, reducer: R) -> Self {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    /// Use an async closure as the reducer.
    pub fn reduce<F, Fut>(self, reducer: F) -> Self
    where
        F: Fn(PipelineContext<S, I, A>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.with_reducer(reduce_fn(reducer))
    }

    /// Commit `recover(error, current)` for every unhandled error.
    pub fn recover_with<F>(mut self, recover: F) -> Self
    where
        F: Fn(&anyhow::Error, &S) -> S + Send + Sync + 'static,
    {
        self.recover = Recover::State(Arc::new(recover));
        self
    }

    /// Terminate the run on the first unhandled error.
    pub fn rethrow_errors(mut self) -> Self {
        self.recover = Recover::Rethrow;
        self
    }

    /// Install [`DisallowRestartPlugin`].
    pub fn disallow_restart(self) -> Self {
        self.with_plugin(DisallowRestartPlugin::new())
    }

    /// Freeze the plugin chain and create the store.
    pub fn build(self) -> Result<Store<S, I, A>, StoreError> {
        let chain = PluginChain::new(self.plugins)?;
        let actions = ActionChannel::new(self.config.action_share_behavior);
        let (intents, queue) = mpsc::unbounded_channel();
        let (commits, _) = broadcast::channel(self.config.state_capacity.max(1));

        debug!(
            store = %self.config.name,
            plugins = chain.len(),
            has_reducer = self.reducer.is_some(),
            "store built"
        );

        let core = StoreCore {
            config: self.config,
            chain,
            reducer: self.reducer,
            recover: self.recover,
            state_lock: tokio::sync::Mutex::new(()),
            state: watch::Sender::new(self.initial),
            commits,
            intents,
            queue: Mutex::new(Some(queue)),
            actions,
            jobs: JobRegistry::new(),
            lifecycle: Mutex::new(Lifecycle::Idle),
            dropped_intents: AtomicUsize::new(0),
            subscribers: Arc::new(AtomicUsize::new(0)),
        };
        Ok(Store {
            core: Arc::new(core),
        })
    }
}

// =============================================================================
// Store
// =============================================================================

/// A running or startable state container. Cheap to clone.
pub struct Store<S, I, A> {
    core: Arc<StoreCore<S, I, A>>,
}

impl<S, I, A> Clone for Store<S, I, A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<S: State, I: Intent, A: Action> Store<S, I, A> {
    pub fn builder(initial: S) -> StoreBuilder<S, I, A> {
        StoreBuilder::new(initial)
    }

    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    /// Start a new run.
    ///
    /// Runs the `on_start` chain, then spawns the consumer loop on the
    /// current tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyStarted`] if a run is active; it is unaffected
    /// - [`StoreError::RestartDisallowed`] if the store is closed
    /// - [`StoreError::StartFailed`] if an `on_start` hook failed and
    ///   `abort_on_start_failure` is set
    /// - [`StoreError::Terminated`] / [`StoreError::Cancelled`] if the run
    ///   ended while starting
    pub async fn start(&self) -> Result<StoreRun, StoreError> {
        let run = Arc::new(RunScope::new());
        {
            let mut lifecycle = lock_unpoisoned(&self.core.lifecycle);
            match *lifecycle {
                Lifecycle::Starting(_) | Lifecycle::Running(_) => {
                    return Err(StoreError::AlreadyStarted)
                }
                Lifecycle::Closed => return Err(StoreError::RestartDisallowed),
                Lifecycle::Idle | Lifecycle::Stopped => {
                    *lifecycle = Lifecycle::Starting(run.clone());
                }
            }
        }

        let ctx = PipelineContext::new(self.core.clone(), run.clone());
        debug!(store = %self.core.config.name, run = %run.id, "starting store");

        if let Err(error) = self.notify_start(&ctx).await {
            let closed = matches!(error, StoreError::RestartDisallowed);
            let error = anyhow::Error::new(error);
            self.abort_start(&ctx, &error, closed).await;
            return Err(match error.downcast::<StoreError>() {
                Ok(store_error) => store_error,
                Err(other) => StoreError::StartFailed(other),
            });
        }

        let queue = lock_unpoisoned(&self.core.queue).take();
        let Some(queue) = queue else {
            let error = anyhow::Error::new(StoreError::AlreadyStarted);
            self.abort_start(&ctx, &error, false).await;
            return Err(StoreError::AlreadyStarted);
        };

        *lock_unpoisoned(&self.core.lifecycle) = Lifecycle::Running(run.clone());
        tokio::spawn(consume(ctx, queue));

        info!(store = %self.core.config.name, run = %run.id, "store started");
        Ok(StoreRun { run })
    }

    async fn notify_start(&self, ctx: &PipelineContext<S, I, A>) -> Result<(), StoreError> {
        let abort = self.core.config.abort_on_start_failure;
        for failure in self.core.chain.on_start(ctx, abort).await {
            if matches!(
                failure.downcast_ref::<StoreError>(),
                Some(StoreError::RestartDisallowed)
            ) {
                return Err(StoreError::RestartDisallowed);
            }
            if abort && !is_cancellation(&failure) {
                return Err(StoreError::StartFailed(failure));
            }
            match ctx.handle_error(failure).await {
                Ok(()) => {}
                Err(Exit::Cancelled) => return Err(StoreError::Cancelled),
                Err(Exit::Failed(error)) => return Err(StoreError::Terminated(Arc::new(error))),
            }
        }

        if ctx.run.token.is_cancelled() {
            return Err(match ctx.run.failure() {
                Some(error) => StoreError::Terminated(error),
                None => StoreError::Cancelled,
            });
        }
        Ok(())
    }

    async fn abort_start(&self, ctx: &PipelineContext<S, I, A>, error: &anyhow::Error, closed: bool) {
        let run = &ctx.run;
        run.token.cancel();
        self.core.jobs.cancel_all().await;
        run.tasks.close();
        run.tasks.wait().await;
        let failure = (!is_cancellation(error)).then_some(error);
        self.core.chain.on_stop(failure).await;

        *lock_unpoisoned(&self.core.lifecycle) = if closed {
            Lifecycle::Closed
        } else {
            Lifecycle::Stopped
        };
        run.mark_finished();
        warn!(store = %self.core.config.name, run = %run.id, error = %error, "store failed to start");
    }

    /// Stop the active run and wait for its teardown. No-op when idle.
    pub async fn stop(&self) {
        let Some(run) = self.core.active_run() else {
            return;
        };
        run.token.cancel();
        run.wait_finished().await;
    }

    /// Enqueue an intent. Never blocks.
    pub fn submit(&self, intent: I) {
        self.core.enqueue(intent);
    }

    /// Latest committed state.
    pub fn state(&self) -> S {
        self.core.state.borrow().clone()
    }

    /// Watch the latest committed state.
    pub fn states(&self) -> watch::Receiver<S> {
        self.core.state.subscribe()
    }

    /// The current state followed by every later commit, in commit order.
    pub async fn subscribe_states(&self) -> StateSubscription<S> {
        let _guard = self.core.state_lock.lock().await;
        let current = self.core.state.borrow().clone();
        StateSubscription {
            pending: Some(current),
            commits: self.core.commits.subscribe(),
        }
    }

    /// Open an action stream according to the store's share behaviour.
    pub fn actions(&self) -> ActionStream<A> {
        self.core.actions.subscribe()
    }

    /// Attach a counted subscriber.
    ///
    /// If a run is active, `on_subscribe` hooks are notified with the new
    /// subscriber count. The count drops when the subscription is dropped.
    pub async fn subscribe(&self) -> Subscription<S, A> {
        let states = self.subscribe_states().await;
        let actions = self.actions();
        let count = self.core.subscribers.fetch_add(1, Ordering::AcqRel) + 1;
        let guard = SubscriberGuard(self.core.subscribers.clone());
        debug!(store = %self.core.config.name, subscribers = count, "subscriber attached");

        if let Some(run) = self.core.active_run() {
            let ctx = PipelineContext::new(self.core.clone(), run);
            let hooks = ctx.clone();
            ctx.launch(async move {
                for failure in hooks.core.chain.on_subscribe(&hooks, count).await {
                    hooks.recover(failure).await;
                }
                Ok(())
            });
        }

        Subscription {
            states,
            actions,
            _guard: guard,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *lock_unpoisoned(&self.core.lifecycle),
            Lifecycle::Running(_)
        )
    }

    /// Whether the store can never run again.
    pub fn is_closed(&self) -> bool {
        matches!(*lock_unpoisoned(&self.core.lifecycle), Lifecycle::Closed)
    }

    /// Intents dropped because the store was closed.
    pub fn dropped_intents(&self) -> usize {
        self.core.dropped_intents.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.core.subscribers.load(Ordering::Acquire)
    }

    /// Names of installed plugins, in chain order.
    pub fn plugin_names(&self) -> Vec<String> {
        self.core.chain.names()
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.core.jobs
    }

    /// A context bound to a run that never started.
    #[cfg(test)]
    pub(crate) fn detached_context(&self) -> PipelineContext<S, I, A> {
        PipelineContext::new(self.core.clone(), Arc::new(RunScope::new()))
    }
}

impl<S: State, I: Intent, A: Action> std::fmt::Debug for Store<S, I, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.core.config.name)
            .field("plugins", &self.core.chain.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Consumer Loop
// =============================================================================

async fn consume<S: State, I: Intent, A: Action>(
    ctx: PipelineContext<S, I, A>,
    mut intents: mpsc::UnboundedReceiver<I>,
) {
    let token = ctx.run.token.clone();
    loop {
        let intent = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            intent = intents.recv() => match intent {
                Some(intent) => intent,
                None => break,
            },
        };

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            outcome = ctx.process_intent(intent) => outcome,
        };
        match outcome {
            Ok(()) => {}
            Err(Exit::Cancelled) => {
                debug!(store = %ctx.store_name(), run = %ctx.run.id, "run cancelled by intent");
                break;
            }
            Err(Exit::Failed(error)) => {
                ctx.run.fail(error);
                break;
            }
        }

        tokio::task::yield_now().await;
    }

    teardown(ctx, intents).await;
}

async fn teardown<S: State, I: Intent, A: Action>(
    ctx: PipelineContext<S, I, A>,
    mut intents: mpsc::UnboundedReceiver<I>,
) {
    let core = &ctx.core;
    let run = &ctx.run;

    run.token.cancel();
    core.jobs.cancel_all().await;
    run.tasks.close();
    run.tasks.wait().await;

    let mut dropped = 0usize;
    while intents.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(store = %core.config.name, run = %run.id, dropped, "dropping unprocessed intents");
    }
    *lock_unpoisoned(&core.queue) = Some(intents);

    let failure = run.failure();
    core.chain.on_stop(failure.as_deref()).await;

    *lock_unpoisoned(&core.lifecycle) = if core.chain.contains(DISALLOW_RESTART_PLUGIN_NAME) {
        Lifecycle::Closed
    } else {
        Lifecycle::Stopped
    };
    run.mark_finished();

    match failure {
        Some(failure) => {
            error!(store = %core.config.name, run = %run.id, error = %failure, "store terminated")
        }
        None => info!(store = %core.config.name, run = %run.id, "store stopped"),
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Handle to one run of a store.
#[derive(Clone)]
pub struct StoreRun {
    run: Arc<RunScope>,
}

impl StoreRun {
    pub fn id(&self) -> Uuid {
        self.run.id
    }

    /// Request the run to stop without waiting for it.
    pub fn cancel(&self) {
        self.run.token.cancel();
    }

    /// Stop the run and wait for its teardown.
    pub async fn stop(&self) {
        self.cancel();
        self.run.wait_finished().await;
    }

    /// Wait for the run to end.
    ///
    /// Returns [`StoreError::Terminated`] if the run ended with an
    /// unhandled error.
    pub async fn join(&self) -> Result<(), StoreError> {
        self.run.wait_finished().await;
        match self.run.failure() {
            Some(error) => Err(StoreError::Terminated(error)),
            None => Ok(()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.run.is_finished()
    }
}

impl std::fmt::Debug for StoreRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRun")
            .field("id", &self.run.id)
            .field("finished", &self.run.is_finished())
            .finish()
    }
}

/// The current state followed by every later commit.
pub struct StateSubscription<S> {
    pending: Option<S>,
    commits: broadcast::Receiver<S>,
}

impl<S: State> StateSubscription<S> {
    /// Next state. A subscriber that falls more than `state_capacity`
    /// commits behind skips the oldest ones.
    pub async fn recv(&mut self) -> Option<S> {
        if let Some(state) = self.pending.take() {
            return Some(state);
        }
        loop {
            match self.commits.recv().await {
                Ok(state) => return Some(state),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "state subscriber lagged, skipped commits");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = S> {
        stream::unfold(self, |mut states| async move {
            let state = states.recv().await?;
            Some((state, states))
        })
    }
}

/// A counted subscriber: states plus actions.
pub struct Subscription<S, A> {
    pub states: StateSubscription<S>,
    pub actions: ActionStream<A>,
    _guard: SubscriberGuard,
}

struct SubscriberGuard(Arc<AtomicUsize>);

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
