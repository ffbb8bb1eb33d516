//! Plugin that lets a store run only once.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;

use crate::context::PipelineContext;
use crate::core::{Action, Intent, State};
use crate::error::StoreError;
use crate::plugin::Plugin;

/// Name under which [`DisallowRestartPlugin`] is installed.
pub const DISALLOW_RESTART_PLUGIN_NAME: &str = "disallow-restart";

/// Fails every start after the first one with
/// [`StoreError::RestartDisallowed`].
///
/// When this plugin is installed the store also closes itself once its run
/// ends, so intents submitted afterwards are dropped instead of buffered.
#[derive(Debug, Default)]
pub struct DisallowRestartPlugin {
    started: AtomicBool,
}

impl DisallowRestartPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<S: State, I: Intent, A: Action> Plugin<S, I, A> for DisallowRestartPlugin {
    fn name(&self) -> &str {
        DISALLOW_RESTART_PLUGIN_NAME
    }

    async fn on_start(&self, _ctx: &PipelineContext<S, I, A>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(StoreError::RestartDisallowed.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let plugin = DisallowRestartPlugin::new();
        let ctx = Store::<i32, i32, i32>::builder(0)
            .build()
            .unwrap()
            .detached_context();

        assert!(Plugin::<i32, i32, i32>::on_start(&plugin, &ctx).await.is_ok());
        let err = Plugin::<i32, i32, i32>::on_start(&plugin, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::RestartDisallowed)
        ));
    }
}
