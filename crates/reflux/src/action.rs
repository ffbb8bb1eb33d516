//! Action distribution.
//!
//! Actions are one-shot notifications ("navigate back", "show a toast") that
//! are not part of state. How they reach subscribers is fixed per store by
//! [`ActionShareBehavior`]:
//!
//! | Behaviour    | Delivery                                  | Late subscribers          |
//! |--------------|-------------------------------------------|---------------------------|
//! | `Distribute` | each action to exactly one receiver       | get what is still buffered |
//! | `Share`      | each action to every active receiver      | miss earlier actions       |
//! | `Disabled`   | emitting is a no-op                       | stream is already closed  |
//!
//! # Backpressure
//!
//! Only `Distribute` with [`Overflow::Suspend`] can make `emit_action`
//! suspend. `Share` never blocks: a receiver that falls more than `buffer`
//! actions behind loses the oldest ones and logs how many it missed.

use std::sync::Arc;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{trace, warn};

use crate::core::Action;

/// Default action buffer size.
pub const DEFAULT_ACTION_BUFFER: usize = 64;

/// What to do when a `Distribute` buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overflow {
    /// Suspend the emitter until a receiver frees a slot.
    #[default]
    Suspend,
    /// Drop the oldest buffered action to make room.
    DropOldest,
    /// Drop the action being emitted.
    DropLatest,
}

/// Distribution policy for actions, fixed for the store's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionShareBehavior {
    /// Point-to-point: each action is received by exactly one subscriber.
    Distribute { buffer: usize, overflow: Overflow },
    /// Broadcast: each action is received by every active subscriber.
    Share { buffer: usize },
    /// Actions are not delivered at all.
    Disabled,
}

impl Default for ActionShareBehavior {
    fn default() -> Self {
        ActionShareBehavior::Distribute {
            buffer: DEFAULT_ACTION_BUFFER,
            overflow: Overflow::Suspend,
        }
    }
}

/// The store-owned sending side of the action channel.
pub(crate) enum ActionChannel<A> {
    Distribute {
        tx: mpsc::Sender<A>,
        rx: Arc<Mutex<mpsc::Receiver<A>>>,
        overflow: Overflow,
    },
    Share {
        tx: broadcast::Sender<A>,
    },
    Disabled,
}

impl<A: Action> ActionChannel<A> {
    pub(crate) fn new(behavior: ActionShareBehavior) -> Self {
        match behavior {
            ActionShareBehavior::Distribute { buffer, overflow } => {
                let (tx, rx) = mpsc::channel(buffer.max(1));
                ActionChannel::Distribute {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                    overflow,
                }
            }
            ActionShareBehavior::Share { buffer } => {
                let (tx, _) = broadcast::channel(buffer.max(1));
                ActionChannel::Share { tx }
            }
            ActionShareBehavior::Disabled => ActionChannel::Disabled,
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        matches!(self, ActionChannel::Disabled)
    }

    /// Deliver an action according to the configured behaviour.
    pub(crate) async fn send(&self, action: A) {
        match self {
            ActionChannel::Distribute { tx, rx, overflow } => match overflow {
                Overflow::Suspend => {
                    // The store keeps the receiver alive, so this only fails
                    // while the store itself is being dropped.
                    if tx.send(action).await.is_err() {
                        trace!("action channel closed, dropping action");
                    }
                }
                Overflow::DropLatest => {
                    if let Err(TrySendError::Full(_)) = tx.try_send(action) {
                        warn!("action buffer full, dropping newest action");
                    }
                }
                Overflow::DropOldest => {
                    let mut pending = action;
                    loop {
                        match tx.try_send(pending) {
                            Ok(()) => break,
                            Err(TrySendError::Full(returned)) => {
                                pending = returned;
                                if rx.lock().await.try_recv().is_ok() {
                                    warn!("action buffer full, dropped oldest action");
                                }
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                }
            },
            ActionChannel::Share { tx } => {
                // Err only means nobody is listening right now; no replay.
                let _ = tx.send(action);
            }
            ActionChannel::Disabled => {
                trace!("actions are disabled, ignoring emitted action");
            }
        }
    }

    /// Open a new receiving end.
    pub(crate) fn subscribe(&self) -> ActionStream<A> {
        let inner = match self {
            ActionChannel::Distribute { rx, .. } => StreamInner::Distribute(rx.clone()),
            ActionChannel::Share { tx } => StreamInner::Share(tx.subscribe()),
            ActionChannel::Disabled => StreamInner::Closed,
        };
        ActionStream { inner }
    }
}

/// A subscriber's view of the store's actions.
pub struct ActionStream<A> {
    inner: StreamInner<A>,
}

enum StreamInner<A> {
    Distribute(Arc<Mutex<mpsc::Receiver<A>>>),
    Share(broadcast::Receiver<A>),
    Closed,
}

impl<A: Action> ActionStream<A> {
    /// Receive the next action.
    ///
    /// Returns `None` once the stream is closed, which for a `Disabled`
    /// store is immediately.
    pub async fn recv(&mut self) -> Option<A> {
        match &mut self.inner {
            StreamInner::Distribute(rx) => rx.lock().await.recv().await,
            StreamInner::Share(rx) => loop {
                match rx.recv().await {
                    Ok(action) => return Some(action),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "action subscriber lagged, missed actions");
                    }
                    Err(RecvError::Closed) => return None,
                }
            },
            StreamInner::Closed => None,
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = A> {
        stream::unfold(self, |mut actions| async move {
            let action = actions.recv().await?;
            Some((action, actions))
        })
    }
}

impl<A> std::fmt::Debug for ActionStream<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            StreamInner::Distribute(_) => "distribute",
            StreamInner::Share(_) => "share",
            StreamInner::Closed => "closed",
        };
        f.debug_struct("ActionStream")
            .field("kind", &kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::time::timeout;

    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    fn distribute(buffer: usize, overflow: Overflow) -> ActionChannel<u32> {
        ActionChannel::new(ActionShareBehavior::Distribute { buffer, overflow })
    }

    #[tokio::test]
    async fn test_distribute_delivers_each_action_once() {
        let channel = distribute(16, Overflow::Suspend);
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        for i in 0..4 {
            channel.send(i).await;
        }

        let mut received = Vec::new();
        while let Ok(Some(action)) = timeout(SHORT, first.recv()).await {
            received.push(action);
        }
        while let Ok(Some(action)) = timeout(SHORT, second.recv()).await {
            received.push(action);
        }
        received.sort();
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_distribute_buffers_until_subscribed() {
        let channel = distribute(8, Overflow::Suspend);
        channel.send(7).await;

        let mut late = channel.subscribe();
        assert_eq!(late.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_distribute_suspends_when_full() {
        let channel = distribute(1, Overflow::Suspend);
        channel.send(1).await;

        let blocked = timeout(SHORT, channel.send(2)).await;
        assert!(blocked.is_err(), "second send should wait for a free slot");
    }

    #[tokio::test]
    async fn test_distribute_drop_oldest() {
        let channel = distribute(2, Overflow::DropOldest);
        for i in 1..=3 {
            channel.send(i).await;
        }

        let mut actions = channel.subscribe();
        assert_eq!(actions.recv().await, Some(2));
        assert_eq!(actions.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_distribute_drop_latest() {
        let channel = distribute(2, Overflow::DropLatest);
        for i in 1..=3 {
            channel.send(i).await;
        }

        let mut actions = channel.subscribe();
        assert_eq!(actions.recv().await, Some(1));
        assert_eq!(actions.recv().await, Some(2));
        assert!(timeout(SHORT, actions.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_share_delivers_to_every_subscriber() {
        let channel: ActionChannel<u32> =
            ActionChannel::new(ActionShareBehavior::Share { buffer: 8 });
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        channel.send(42).await;

        assert_eq!(first.recv().await, Some(42));
        assert_eq!(second.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_share_has_no_replay() {
        let channel: ActionChannel<u32> =
            ActionChannel::new(ActionShareBehavior::Share { buffer: 8 });
        channel.send(1).await;

        let mut late = channel.subscribe();
        channel.send(2).await;
        assert_eq!(late.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_share_lagging_subscriber_skips_oldest() {
        let channel: ActionChannel<u32> =
            ActionChannel::new(ActionShareBehavior::Share { buffer: 2 });
        let mut slow = channel.subscribe();

        for i in 0..5 {
            channel.send(i).await;
        }

        assert_eq!(slow.recv().await, Some(3));
        assert_eq!(slow.recv().await, Some(4));
    }

    #[tokio::test]
    async fn test_disabled_never_blocks_and_stream_is_closed() {
        let channel: ActionChannel<u32> = ActionChannel::new(ActionShareBehavior::Disabled);
        let mut actions = channel.subscribe();

        for i in 0..1_000 {
            timeout(SHORT, channel.send(i))
                .await
                .expect("disabled send must not block");
        }
        assert_eq!(actions.recv().await, None);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let channel: ActionChannel<u32> =
            ActionChannel::new(ActionShareBehavior::Share { buffer: 8 });
        let stream = channel.subscribe().into_stream();
        channel.send(5).await;
        channel.send(6).await;

        let collected: Vec<u32> = stream.take(2).collect().await;
        assert_eq!(collected, vec![5, 6]);
    }

    #[test]
    fn test_behavior_serde() {
        let json = r#"{"kind":"distribute","buffer":4,"overflow":"drop_oldest"}"#;
        let behavior: ActionShareBehavior = serde_json::from_str(json).unwrap();
        assert_eq!(
            behavior,
            ActionShareBehavior::Distribute {
                buffer: 4,
                overflow: Overflow::DropOldest
            }
        );

        let disabled: ActionShareBehavior = serde_json::from_str(r#"{"kind":"disabled"}"#).unwrap();
        assert_eq!(disabled, ActionShareBehavior::Disabled);
    }
}
