//! The ordered, frozen chain of plugins.
//!
//! Transform hooks compose as a left-to-right pipe:
//!
//! ```text
//! v1 = p1.on_intent(v0)
//! v2 = p2.on_intent(v1)
//! ...
//! ```
//!
//! `Flow::Consumed` at step k short-circuits steps k+1..n. The plugin list is
//! fixed when the store is built; nothing can add or remove a plugin while a
//! pass is running.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{trace, warn};

use crate::context::PipelineContext;
use crate::core::{Action, Flow, Intent, State};
use crate::error::{is_cancellation, StoreError};
use crate::plugin::Plugin;

pub(crate) type SharedPlugin<S, I, A> = Arc<dyn Plugin<S, I, A>>;

pub(crate) struct PluginChain<S, I, A> {
    plugins: Arc<[SharedPlugin<S, I, A>]>,
}

impl<S: State, I: Intent, A: Action> PluginChain<S, I, A> {
    /// Freeze `plugins` into a chain, rejecting duplicate names.
    pub(crate) fn new(plugins: Vec<SharedPlugin<S, I, A>>) -> Result<Self, StoreError> {
        let mut seen = HashSet::with_capacity(plugins.len());
        for plugin in &plugins {
            if !seen.insert(plugin.name().to_string()) {
                return Err(StoreError::PluginNameConflict {
                    name: plugin.name().to_string(),
                });
            }
        }
        Ok(Self {
            plugins: plugins.into(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.plugins.len()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.plugins.iter().any(|plugin| plugin.name() == name)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.plugins
            .iter()
            .map(|plugin| plugin.name().to_string())
            .collect()
    }

    pub(crate) async fn on_intent(&self, ctx: &PipelineContext<S, I, A>, intent: I) -> Result<Flow<I>> {
        let mut current = intent;
        for plugin in self.plugins.iter() {
            match plugin.on_intent(ctx, current).await? {
                Flow::Forward(next) => current = next,
                Flow::Consumed => {
                    trace!(plugin = plugin.name(), "intent consumed");
                    return Ok(Flow::Consumed);
                }
            }
        }
        Ok(Flow::Forward(current))
    }

    pub(crate) async fn on_state(
        &self,
        ctx: &PipelineContext<S, I, A>,
        old: &S,
        new: S,
    ) -> Result<Flow<S>> {
        let mut current = new;
        for plugin in self.plugins.iter() {
            match plugin.on_state(ctx, old, current).await? {
                Flow::Forward(next) => current = next,
                Flow::Consumed => {
                    trace!(plugin = plugin.name(), "state transition vetoed");
                    return Ok(Flow::Consumed);
                }
            }
        }
        Ok(Flow::Forward(current))
    }

    pub(crate) async fn on_action(&self, ctx: &PipelineContext<S, I, A>, action: A) -> Result<Flow<A>> {
        let mut current = action;
        for plugin in self.plugins.iter() {
            match plugin.on_action(ctx, current).await? {
                Flow::Forward(next) => current = next,
                Flow::Consumed => {
                    trace!(plugin = plugin.name(), "action consumed");
                    return Ok(Flow::Consumed);
                }
            }
        }
        Ok(Flow::Forward(current))
    }

    pub(crate) async fn on_exception(
        &self,
        ctx: &PipelineContext<S, I, A>,
        error: anyhow::Error,
    ) -> Flow<anyhow::Error> {
        let mut current = error;
        for plugin in self.plugins.iter() {
            match plugin.on_exception(ctx, current).await {
                Flow::Forward(next) => current = next,
                Flow::Consumed => {
                    trace!(plugin = plugin.name(), "error recovered");
                    return Flow::Consumed;
                }
            }
        }
        Flow::Forward(current)
    }

    /// Notify every plugin that a run is starting.
    ///
    /// Failures are returned to the caller in order of occurrence. With
    /// `abort_on_failure`, notification stops at the first failure.
    /// Cancellation and [`StoreError::RestartDisallowed`] always stop it.
    pub(crate) async fn on_start(
        &self,
        ctx: &PipelineContext<S, I, A>,
        abort_on_failure: bool,
    ) -> Vec<anyhow::Error> {
        let mut failures = Vec::new();
        for plugin in self.plugins.iter() {
            if let Err(err) = plugin.on_start(ctx).await {
                warn!(plugin = plugin.name(), error = %err, "on_start failed");
                let fatal = is_cancellation(&err)
                    || matches!(
                        err.downcast_ref::<StoreError>(),
                        Some(StoreError::RestartDisallowed)
                    );
                failures.push(err);
                if fatal || abort_on_failure {
                    break;
                }
            }
        }
        failures
    }

    /// Notify every plugin that a subscriber attached. All plugins are
    /// notified; failures are returned.
    pub(crate) async fn on_subscribe(
        &self,
        ctx: &PipelineContext<S, I, A>,
        subscriber_count: usize,
    ) -> Vec<anyhow::Error> {
        let mut failures = Vec::new();
        for plugin in self.plugins.iter() {
            if let Err(err) = plugin.on_subscribe(ctx, subscriber_count).await {
                warn!(plugin = plugin.name(), error = %err, "on_subscribe failed");
                failures.push(err);
            }
        }
        failures
    }

    /// Notify every plugin that the run ended, in reverse insertion order.
    pub(crate) async fn on_stop(&self, error: Option<&anyhow::Error>) {
        for plugin in self.plugins.iter().rev() {
            plugin.on_stop(error).await;
        }
    }
}
