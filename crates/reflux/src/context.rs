//! Pipeline context: the capability handle passed to reducers and plugins.
//!
//! A [`PipelineContext`] is cheap to clone and is bound to one run of the
//! store. Through it, code can:
//! - read and update state under the store's state lock
//! - emit actions
//! - submit further intents
//! - launch work scoped to the run, and register it as a named job
//! - route errors through the exception path manually
//!
//! # State Lock
//!
//! `update_state`, `try_update_state` and `with_state` all serialize on
//! one `tokio::sync::Mutex`. The lock is fair, so the sequence of committed
//! states is the order in which callers acquired it. `on_state` hooks run
//! while it is held.
//!
//! # Error Path
//!
//! Errors raised while reducing an intent, or inside launched work, go
//! through the same path:
//!
//! ```text
//! error ──► cancellation? ──yes──► terminate the unit of work
//!             │ no
//!             ▼
//!        on_exception chain ──Consumed──► recovered
//!             │ Forward(err)
//!             ▼
//!        Recover policy: Log | State(f) | Rethrow (terminates the run)
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::action::ActionChannel;
use crate::chain::PluginChain;
use crate::config::StoreConfig;
use crate::core::{lock_unpoisoned, Action, Flow, Intent, State};
use crate::error::{into_reduction, is_cancellation};
use crate::job::JobRegistry;
use crate::reducer::Reducer;

// =============================================================================
// Recover Policy
// =============================================================================

/// What the store does with an error no `on_exception` hook recovered.
pub enum Recover<S> {
    /// Log the error and keep the current state. The loop keeps running.
    Log,
    /// Commit the state produced from the error and the current state.
    State(Arc<dyn Fn(&anyhow::Error, &S) -> S + Send + Sync>),
    /// Terminate the current run. `on_stop` hooks receive the error.
    Rethrow,
}

impl<S> Default for Recover<S> {
    fn default() -> Self {
        Recover::Log
    }
}

impl<S> std::fmt::Debug for Recover<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recover::Log => f.write_str("Recover::Log"),
            Recover::State(_) => f.write_str("Recover::State(..)"),
            Recover::Rethrow => f.write_str("Recover::Rethrow"),
        }
    }
}

// =============================================================================
// Store Core
// =============================================================================

/// Lifecycle of a store across runs.
pub(crate) enum Lifecycle {
    /// Built, never started.
    Idle,
    /// `on_start` hooks are running.
    Starting(Arc<RunScope>),
    /// The consumer loop is running.
    Running(Arc<RunScope>),
    /// The last run finished; the store may be started again.
    Stopped,
    /// The store may never run again. Submitted intents are dropped.
    Closed,
}

/// Everything a store owns for its whole lifetime.
pub(crate) struct StoreCore<S, I, A> {
    pub(crate) config: StoreConfig,
    pub(crate) chain: PluginChain<S, I, A>,
    pub(crate) reducer: Option<Arc<dyn Reducer<S, I, A>>>,
    pub(crate) recover: Recover<S>,
    pub(crate) state_lock: tokio::sync::Mutex<()>,
    pub(crate) state: watch::Sender<S>,
    pub(crate) commits: broadcast::Sender<S>,
    pub(crate) intents: mpsc::UnboundedSender<I>,
    /// Receiving end of the intent queue while no run holds it.
    pub(crate) queue: Mutex<Option<mpsc::UnboundedReceiver<I>>>,
    pub(crate) actions: ActionChannel<A>,
    pub(crate) jobs: JobRegistry,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) dropped_intents: AtomicUsize,
    pub(crate) subscribers: Arc<AtomicUsize>,
}

impl<S: State, I: Intent, A: Action> StoreCore<S, I, A> {
    /// Enqueue an intent, or drop it if the store is closed for good.
    pub(crate) fn enqueue(&self, intent: I) {
        if matches!(*lock_unpoisoned(&self.lifecycle), Lifecycle::Closed) {
            self.drop_intent("store is closed");
            return;
        }
        if self.intents.send(intent).is_err() {
            self.drop_intent("intent queue is gone");
        }
    }

    /// The run that is starting or running, if any.
    pub(crate) fn active_run(&self) -> Option<Arc<RunScope>> {
        match &*lock_unpoisoned(&self.lifecycle) {
            Lifecycle::Starting(run) | Lifecycle::Running(run) => Some(run.clone()),
            _ => None,
        }
    }

    fn drop_intent(&self, reason: &'static str) {
        let dropped = self.dropped_intents.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(store = %self.config.name, reason, dropped, "dropping submitted intent");
    }

    /// Publish a new state. Callers hold the state lock.
    fn commit(&self, state: S) {
        self.state.send_replace(state.clone());
        // Err only means no state subscribers are attached.
        let _ = self.commits.send(state);
    }
}

// =============================================================================
// Run Scope
// =============================================================================

/// Everything tied to one run of the consumer loop.
pub(crate) struct RunScope {
    pub(crate) id: Uuid,
    pub(crate) token: CancellationToken,
    pub(crate) tasks: TaskTracker,
    failure: Mutex<Option<Arc<anyhow::Error>>>,
    finished: watch::Sender<bool>,
}

impl RunScope {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            failure: Mutex::new(None),
            finished: watch::Sender::new(false),
        }
    }

    /// Record the terminal error (first one wins) and cancel the run.
    pub(crate) fn fail(&self, error: anyhow::Error) {
        {
            let mut slot = lock_unpoisoned(&self.failure);
            if slot.is_none() {
                *slot = Some(Arc::new(error));
            }
        }
        self.token.cancel();
    }

    /// The error this run was terminated with, if any.
    pub(crate) fn failure(&self) -> Option<Arc<anyhow::Error>> {
        lock_unpoisoned(&self.failure).clone()
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    pub(crate) fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait until teardown of this run has completed.
    pub(crate) async fn wait_finished(&self) {
        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }
}

/// Why a unit of work stopped.
#[derive(Debug)]
pub(crate) enum Exit {
    /// Cooperative cancellation; not an error.
    Cancelled,
    /// An unhandled error under `Recover::Rethrow`.
    Failed(anyhow::Error),
}

// =============================================================================
// Pipeline Context
// =============================================================================

/// Capability handle for reducers and plugin hooks.
///
/// See the [module documentation](self) for the guarantees.
pub struct PipelineContext<S, I, A> {
    pub(crate) core: Arc<StoreCore<S, I, A>>,
    pub(crate) run: Arc<RunScope>,
}

impl<S, I, A> Clone for PipelineContext<S, I, A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            run: self.run.clone(),
        }
    }
}

impl<S: State, I: Intent, A: Action> PipelineContext<S, I, A> {
    pub(crate) fn new(core: Arc<StoreCore<S, I, A>>, run: Arc<RunScope>) -> Self {
        Self { core, run }
    }

    /// Name of the store this context belongs to.
    pub fn store_name(&self) -> &str {
        &self.core.config.name
    }

    /// Identifier of the current run.
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    /// Whether the run this context belongs to is still active.
    pub fn is_active(&self) -> bool {
        !self.run.token.is_cancelled()
    }

    /// Latest committed state, without taking the state lock.
    pub fn state(&self) -> S {
        self.core.state.borrow().clone()
    }

    /// Read the state under the state lock.
    pub async fn with_state<R, F>(&self, block: F) -> R
    where
        F: FnOnce(&S) -> R + Send,
    {
        let _guard = self.core.state_lock.lock().await;
        let state = self.core.state.borrow();
        block(&state)
    }

    /// Replace the state with `transform(current)`.
    ///
    /// `on_state` hooks run between the old and the new value before the
    /// commit; if one vetoes, the old state stays and is returned.
    pub async fn update_state<F>(&self, transform: F) -> Result<S>
    where
        F: FnOnce(&S) -> S + Send,
    {
        self.try_update_state(|state| Ok(transform(state))).await
    }

    /// Like [`update_state`](Self::update_state) with a fallible transform.
    ///
    /// If `transform` or an `on_state` hook fails, the state is unchanged and
    /// the error is returned.
    pub async fn try_update_state<F>(&self, transform: F) -> Result<S>
    where
        F: FnOnce(&S) -> Result<S> + Send,
    {
        let _guard = self.core.state_lock.lock().await;
        let old = self.core.state.borrow().clone();
        let new = transform(&old)?;
        match self.core.chain.on_state(self, &old, new).await? {
            Flow::Forward(new) => {
                self.core.commit(new.clone());
                Ok(new)
            }
            Flow::Consumed => Ok(old),
        }
    }

    /// Emit an action to subscribers.
    ///
    /// `on_action` hooks run first. Suspends only under
    /// `Distribute` + `Overflow::Suspend` with a full buffer.
    pub async fn emit_action(&self, action: A) -> Result<()> {
        if self.core.actions.is_disabled() {
            trace!(store = %self.core.config.name, "actions disabled, not emitting");
            return Ok(());
        }
        if let Flow::Forward(action) = self.core.chain.on_action(self, action).await? {
            self.core.actions.send(action).await;
        }
        Ok(())
    }

    /// Submit an intent to this store's queue.
    pub fn submit(&self, intent: I) {
        self.core.enqueue(intent);
    }

    /// Run `work` concurrently, scoped to the current run.
    ///
    /// The work is cancelled when the run stops. Errors and panics are
    /// isolated from the consumer loop and routed through the exception path.
    pub fn launch<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let ctx = self.clone();
        self.run.tasks.spawn(async move {
            let token = ctx.run.token.clone();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                outcome = AssertUnwindSafe(work).catch_unwind() => outcome,
            };
            let error = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(error)) => error,
                Err(panic) => anyhow!("launched work panicked: {}", panic_message(panic.as_ref())),
            };
            if let Err(Exit::Failed(error)) = ctx.handle_error(error).await {
                ctx.run.fail(error);
            }
        })
    }

    /// Launch `work` as a named job. A job already running under `name` is
    /// cancelled, and has finished, before `work` starts.
    pub async fn launch_job<F>(&self, name: impl Into<String>, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.core.jobs.replace(name, || self.launch(work)).await;
    }

    /// Register an already running task as a named job, stopping the job it
    /// replaces.
    pub async fn register_job(&self, name: impl Into<String>, job: JoinHandle<()>) {
        self.core.jobs.register(name, job).await;
    }

    /// Cancel the named job. Returns `true` if one was registered.
    pub fn cancel_job(&self, name: &str) -> bool {
        self.core.jobs.cancel(name)
    }

    /// The store's job registry.
    pub fn jobs(&self) -> &JobRegistry {
        &self.core.jobs
    }

    /// Route an error through `on_exception` hooks and the recover policy,
    /// as if it had been raised by the reducer.
    pub async fn recover(&self, error: anyhow::Error) {
        match self.handle_error(error).await {
            Ok(()) => {}
            Err(Exit::Cancelled) => self.run.token.cancel(),
            Err(Exit::Failed(error)) => self.run.fail(error),
        }
    }

    /// Stop the current run from inside the pipeline.
    pub fn cancel_run(&self) {
        self.run.token.cancel();
    }

    /// Run one intent through the chain and the reducer.
    pub(crate) async fn process_intent(&self, intent: I) -> Result<(), Exit> {
        let outcome = AssertUnwindSafe(self.reduce(intent)).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(anyhow!(
                "panicked while processing intent: {}",
                panic_message(panic.as_ref())
            )),
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) => self.handle_error(error).await,
        }
    }

    async fn reduce(&self, intent: I) -> Result<()> {
        match self.core.chain.on_intent(self, intent).await? {
            Flow::Forward(intent) => match &self.core.reducer {
                Some(reducer) => reducer.reduce(self, intent).await,
                None => {
                    trace!(store = %self.core.config.name, "no reducer installed, intent ignored");
                    Ok(())
                }
            },
            Flow::Consumed => Ok(()),
        }
    }

    /// The exception path shared by the consumer loop and launched work.
    pub(crate) async fn handle_error(&self, error: anyhow::Error) -> Result<(), Exit> {
        if is_cancellation(&error) {
            return Err(Exit::Cancelled);
        }

        let error = match self.core.chain.on_exception(self, into_reduction(error)).await {
            Flow::Consumed => {
                debug!(store = %self.core.config.name, "error recovered by plugin");
                return Ok(());
            }
            Flow::Forward(error) => error,
        };

        match &self.core.recover {
            Recover::Log => {
                error!(store = %self.core.config.name, error = %error, "unhandled store error");
                Ok(())
            }
            Recover::State(produce) => {
                if let Err(update_error) = self.update_state(|state| produce(&error, state)).await {
                    error!(
                        store = %self.core.config.name,
                        error = %error,
                        update_error = %update_error,
                        "failed to commit recovered state"
                    );
                }
                Ok(())
            }
            Recover::Rethrow => Err(Exit::Failed(error)),
        }
    }
}

impl<S, I, A> std::fmt::Debug for PipelineContext<S, I, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("store", &self.core.config.name)
            .field("run", &self.run.id)
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
