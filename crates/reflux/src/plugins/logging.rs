//! Plugin that logs everything passing through a store.

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use tracing::Level;

use crate::context::PipelineContext;
use crate::core::{Action, Flow, Intent, State};
use crate::plugin::Plugin;

/// Default name of [`LoggingPlugin`].
pub const LOGGING_PLUGIN_NAME: &str = "logging";

// tracing needs the level at the callsite, so dispatch on it here.
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!($($arg)+),
            Level::WARN => tracing::warn!($($arg)+),
            Level::INFO => tracing::info!($($arg)+),
            Level::DEBUG => tracing::debug!($($arg)+),
            _ => tracing::trace!($($arg)+),
        }
    };
}

/// Logs every hook of the store at a fixed level.
///
/// Values are passed through untouched; errors are logged and forwarded.
#[derive(Debug, Clone)]
pub struct LoggingPlugin {
    name: String,
    level: Level,
}

impl LoggingPlugin {
    pub fn new(level: Level) -> Self {
        Self {
            name: LOGGING_PLUGIN_NAME.to_string(),
            level,
        }
    }

    /// Install under a different name, e.g. to log at two levels.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

impl Default for LoggingPlugin {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl<S, I, A> Plugin<S, I, A> for LoggingPlugin
where
    S: State + Debug,
    I: Intent + Debug,
    A: Action + Debug,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&self, ctx: &PipelineContext<S, I, A>) -> Result<()> {
        log_at!(self.level, store = %ctx.store_name(), run = %ctx.run_id(), "store started");
        Ok(())
    }

    async fn on_intent(&self, ctx: &PipelineContext<S, I, A>, intent: I) -> Result<Flow<I>> {
        log_at!(self.level, store = %ctx.store_name(), ?intent, "intent");
        Ok(Flow::Forward(intent))
    }

    async fn on_state(&self, ctx: &PipelineContext<S, I, A>, old: &S, new: S) -> Result<Flow<S>> {
        log_at!(self.level, store = %ctx.store_name(), ?old, ?new, "state");
        Ok(Flow::Forward(new))
    }

    async fn on_action(&self, ctx: &PipelineContext<S, I, A>, action: A) -> Result<Flow<A>> {
        log_at!(self.level, store = %ctx.store_name(), ?action, "action");
        Ok(Flow::Forward(action))
    }

    async fn on_exception(
        &self,
        ctx: &PipelineContext<S, I, A>,
        error: anyhow::Error,
    ) -> Flow<anyhow::Error> {
        log_at!(self.level, store = %ctx.store_name(), error = %error, "exception");
        Flow::Forward(error)
    }

    async fn on_subscribe(
        &self,
        ctx: &PipelineContext<S, I, A>,
        subscriber_count: usize,
    ) -> Result<()> {
        log_at!(self.level, store = %ctx.store_name(), subscriber_count, "subscriber attached");
        Ok(())
    }

    async fn on_stop(&self, error: Option<&anyhow::Error>) {
        match error {
            Some(error) => log_at!(self.level, error = %error, "store stopped with error"),
            None => log_at!(self.level, "store stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn test_passes_values_through() {
        let plugin = LoggingPlugin::new(Level::INFO).with_name("audit");
        let ctx = Store::<i32, i32, i32>::builder(0)
            .build()
            .unwrap()
            .detached_context();

        assert_eq!(Plugin::<i32, i32, i32>::name(&plugin), "audit");
        assert_eq!(plugin.on_intent(&ctx, 7).await.unwrap(), Flow::Forward(7));
        assert_eq!(plugin.on_state(&ctx, &1, 2).await.unwrap(), Flow::Forward(2));
        assert_eq!(plugin.on_action(&ctx, 3).await.unwrap(), Flow::Forward(3));
        let forwarded = plugin.on_exception(&ctx, anyhow::anyhow!("boom")).await;
        assert_eq!(forwarded.into_option().map(|e| e.to_string()), Some("boom".to_string()));
    }
}
