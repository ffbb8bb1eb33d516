//! # Counter
//!
//! Runs the counter store with a live timer and a scripted user, printing
//! every state and action until the script navigates back or Ctrl-C.
//!
//! ```text
//! RUST_LOG=info,reflux=debug cargo run -p reflux-counter-demo
//! ```

use std::time::Duration;

use anyhow::Result;
use reflux_counter_demo::{CounterAction, CounterConfig, CounterContainer, CounterIntent};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reflux=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let container = CounterContainer::new(CounterConfig {
        timer_interval: Some(Duration::from_millis(400)),
        ..CounterConfig::default()
    })?;
    let store = container.store.clone();

    let run = store.start().await?;
    let mut subscription = store.subscribe().await;

    // Scripted user
    let user = {
        let store = store.clone();
        tokio::spawn(async move {
            let script = [
                CounterIntent::Increment,
                CounterIntent::Increment,
                CounterIntent::Undo,
                CounterIntent::Redo,
                CounterIntent::Redo,
                CounterIntent::Increment,
                CounterIntent::Back,
            ];
            for intent in script {
                tokio::time::sleep(Duration::from_millis(700)).await;
                info!(?intent, "user");
                store.submit(intent);
            }
        })
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            state = subscription.states.recv() => match state {
                Some(state) => info!(?state, "state"),
                None => break,
            },
            action = subscription.actions.recv() => match action {
                Some(CounterAction::GoBack) => {
                    info!("navigating back");
                    break;
                }
                Some(CounterAction::ShowErrorMessage(message)) => info!(%message, "error message"),
                None => break,
            },
        }
    }

    user.abort();
    store.stop().await;
    run.join().await?;
    info!(
        history = container.history.queue_size(),
        dropped = store.dropped_intents(),
        "done"
    );
    Ok(())
}
