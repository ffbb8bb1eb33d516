//! Core traits for the reflux state-container runtime.
//!
//! # Overview
//!
//! A store works with three kinds of values:
//! - [`State`] = the current snapshot of the domain model (replaced, never mutated)
//! - [`Intent`] = input submitted to the store (consumed at most once)
//! - [`Action`] = a one-shot side-effect notification (not state, not replayed)
//!
//! All three are blanket-implemented, so any plain data type qualifies.
//!
//! # Flow
//!
//! Every transforming plugin hook returns a [`Flow`]: either the (possibly
//! modified) value to hand to the next plugin, or [`Flow::Consumed`] to stop
//! propagation for this value.

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Marker trait for store state.
///
/// State is cloned out of the store for every snapshot, so keep it cheap to
/// clone (wrap large payloads in `Arc`).
pub trait State: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> State for T {}

/// Marker trait for intents.
pub trait Intent: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Intent for T {}

/// Marker trait for actions.
///
/// Actions are `Clone` because the `Share` behaviour delivers each one to
/// every active subscriber.
pub trait Action: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Action for T {}

/// Result of a transforming plugin hook.
///
/// ```ignore
/// async fn on_intent(&self, _ctx: &Ctx, intent: Intent) -> Result<Flow<Intent>> {
///     match intent {
///         Intent::Ping => Ok(Flow::Consumed),
///         other => Ok(Flow::Forward(other)),
///     }
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Flow<T> {
    /// Pass the value on to the next plugin (and finally to the store).
    Forward(T),
    /// The value was handled; later plugins and the store never see it.
    Consumed,
}

impl<T> Flow<T> {
    /// Returns `true` if the value was consumed.
    pub fn is_consumed(&self) -> bool {
        matches!(self, Flow::Consumed)
    }

    /// Convert into an `Option`, `None` meaning consumed.
    pub fn into_option(self) -> Option<T> {
        match self {
            Flow::Forward(value) => Some(value),
            Flow::Consumed => None,
        }
    }

    /// Map the forwarded value, leaving `Consumed` untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Flow<U> {
        match self {
            Flow::Forward(value) => Flow::Forward(f(value)),
            Flow::Consumed => Flow::Consumed,
        }
    }
}

impl<T> From<Option<T>> for Flow<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Flow::Forward(value),
            None => Flow::Consumed,
        }
    }
}

/// Lock a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_from_option() {
        assert_eq!(Flow::from(Some(3)), Flow::Forward(3));
        assert_eq!(Flow::<i32>::from(None), Flow::Consumed);
    }

    #[test]
    fn test_flow_map_keeps_consumed() {
        assert_eq!(Flow::Forward(2).map(|v| v * 10), Flow::Forward(20));
        assert!(Flow::<i32>::Consumed.map(|v| v * 10).is_consumed());
    }

    #[test]
    fn test_flow_into_option() {
        assert_eq!(Flow::Forward("a").into_option(), Some("a"));
        assert_eq!(Flow::<&str>::Consumed.into_option(), None);
    }

    #[test]
    fn test_lock_unpoisoned_recovers() {
        let mutex = std::sync::Arc::new(Mutex::new(5));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the mutex");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*lock_unpoisoned(&mutex), 5);
    }
}
