//! Testing utilities for reflux stores.
//!
//! [`StoreHarness`] starts a store and records everything it publishes, so
//! a test can submit intents and then await the states and actions it
//! expects, with a timeout instead of sleeps.
//!
//! # Quick Start
//!
//! ```ignore
//! use reflux_testing::StoreHarness;
//!
//! #[tokio::test]
//! async fn test_increment() -> anyhow::Result<()> {
//!     let mut harness = StoreHarness::start(counter_store()?).await?;
//!
//!     harness.submit(CounterIntent::Increment);
//!     harness.expect_state(|s| s.value == 1).await?;
//!     harness.assert_no_action(Duration::from_millis(50)).await?;
//!
//!     harness.stop().await
//! }
//! ```
//!
//! # Ordering
//!
//! States are recorded from the moment the harness is created, in commit
//! order. `expect_state` consumes recorded states up to and including the
//! first match, so consecutive expectations describe a sequence.

use std::fmt::Debug;
use std::time::Duration;

use anyhow::{anyhow, Result};
use reflux::{Action, ActionStream, Intent, State, StateSubscription, Store, StoreRun};
use tracing::trace;

/// Default time to wait for an expected state or action.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A started store plus recorders for its states and actions.
pub struct StoreHarness<S, I, A> {
    store: Store<S, I, A>,
    run: StoreRun,
    states: StateSubscription<S>,
    actions: ActionStream<A>,
    timeout: Duration,
}

impl<S, I, A> StoreHarness<S, I, A>
where
    S: State + Debug,
    I: Intent,
    A: Action + Debug,
{
    /// Subscribe to `store` and start it.
    pub async fn start(store: Store<S, I, A>) -> Result<Self> {
        let states = store.subscribe_states().await;
        let actions = store.actions();
        let run = store.start().await?;
        Ok(Self {
            store,
            run,
            states,
            actions,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Change how long expectations wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &Store<S, I, A> {
        &self.store
    }

    pub fn run(&self) -> &StoreRun {
        &self.run
    }

    pub fn submit(&self, intent: I) {
        self.store.submit(intent);
    }

    /// Latest committed state, without consuming anything recorded.
    pub fn state(&self) -> S {
        self.store.state()
    }

    /// The next recorded state.
    pub async fn next_state(&mut self) -> Result<S> {
        tokio::time::timeout(self.timeout, self.states.recv())
            .await
            .map_err(|_| anyhow!("no state committed within {:?}", self.timeout))?
            .ok_or_else(|| anyhow!("state stream closed"))
    }

    /// Consume recorded states until one satisfies `expected`.
    pub async fn expect_state(&mut self, expected: impl Fn(&S) -> bool) -> Result<S> {
        let timeout = self.timeout;
        let mut skipped = Vec::new();
        let found = tokio::time::timeout(timeout, async {
            while let Some(state) = self.states.recv().await {
                if expected(&state) {
                    return Some(state);
                }
                trace!(?state, "skipping state");
                skipped.push(state);
            }
            None
        })
        .await;

        match found {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Err(anyhow!("state stream closed; saw {skipped:?}")),
            Err(_) => Err(anyhow!(
                "expected state not reached within {timeout:?}; saw {skipped:?}"
            )),
        }
    }

    /// The next action.
    pub async fn expect_action(&mut self) -> Result<A> {
        tokio::time::timeout(self.timeout, self.actions.recv())
            .await
            .map_err(|_| anyhow!("no action emitted within {:?}", self.timeout))?
            .ok_or_else(|| anyhow!("action stream closed"))
    }

    /// The next action, which must satisfy `expected`.
    pub async fn expect_action_matching(&mut self, expected: impl Fn(&A) -> bool) -> Result<A> {
        let action = self.expect_action().await?;
        if expected(&action) {
            Ok(action)
        } else {
            Err(anyhow!("unexpected action {action:?}"))
        }
    }

    /// Fail if any action arrives within `window`.
    pub async fn assert_no_action(&mut self, window: Duration) -> Result<()> {
        match tokio::time::timeout(window, self.actions.recv()).await {
            Ok(Some(action)) => Err(anyhow!("unexpected action {action:?}")),
            Ok(None) | Err(_) => Ok(()),
        }
    }

    /// Stop the store and return how its run ended.
    pub async fn stop(self) -> Result<()> {
        self.store.stop().await;
        self.run.join().await?;
        Ok(())
    }
}
