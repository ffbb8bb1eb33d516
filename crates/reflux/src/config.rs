//! Store configuration.
//!
//! Most stores are configured through [`StoreBuilder`](crate::StoreBuilder)
//! methods. `StoreConfig` is the plain-data part of that configuration and
//! can also be loaded from a host application's own config files:
//!
//! ```ignore
//! let config: StoreConfig = serde_json::from_str(r#"{
//!     "name": "counter",
//!     "action_share_behavior": { "kind": "share", "buffer": 32 }
//! }"#)?;
//! let store = Store::builder(State::default()).with_config(config).build()?;
//! ```

use serde::{Deserialize, Serialize};

use crate::action::ActionShareBehavior;

/// Default buffer for state commit notifications.
pub const DEFAULT_STATE_CAPACITY: usize = 1024;

/// Plain-data store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name used in logs and spans.
    pub name: String,
    /// How emitted actions reach subscribers.
    pub action_share_behavior: ActionShareBehavior,
    /// How many commits a state subscriber may fall behind before it
    /// starts skipping the oldest ones.
    pub state_capacity: usize,
    /// Stop notifying `on_start` hooks after the first failure and fail
    /// the start instead.
    pub abort_on_start_failure: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "store".to_string(),
            action_share_behavior: ActionShareBehavior::default(),
            state_capacity: DEFAULT_STATE_CAPACITY,
            abort_on_start_failure: false,
        }
    }
}
