use std::time::Duration;

use reflux::StoreError;
use reflux_counter_demo::{
    CounterAction, CounterConfig, CounterContainer, CounterIntent, CounterState, TIMER_JOB,
};
use reflux_testing::StoreHarness;

fn displaying(timer: u32, counter: i64) -> CounterState {
    CounterState::DisplayingCounter { timer, counter }
}

fn container() -> CounterContainer {
    CounterContainer::new(CounterConfig::default()).unwrap()
}

#[tokio::test]
async fn test_tick_increment_undo() {
    let container = container();
    let mut harness = StoreHarness::start(container.store.clone()).await.unwrap();

    assert_eq!(harness.next_state().await.unwrap(), CounterState::Loading);

    harness.submit(CounterIntent::Tick(5));
    harness.expect_state(|s| *s == displaying(5, 0)).await.unwrap();

    harness.submit(CounterIntent::Increment);
    harness.expect_state(|s| *s == displaying(5, 1)).await.unwrap();

    harness.submit(CounterIntent::Undo);
    harness.expect_state(|s| *s == displaying(5, 0)).await.unwrap();

    harness.submit(CounterIntent::Redo);
    harness.expect_state(|s| *s == displaying(5, 1)).await.unwrap();
    assert_eq!(container.history.queue_size(), 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_ticks_keep_the_counter() {
    let mut harness = StoreHarness::start(container().store).await.unwrap();

    harness.submit(CounterIntent::Tick(1));
    harness.submit(CounterIntent::Increment);
    harness.submit(CounterIntent::Increment);
    harness.submit(CounterIntent::Tick(2));

    harness.expect_state(|s| *s == displaying(2, 2)).await.unwrap();
    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_increment_before_ready_shows_message() {
    let mut harness = StoreHarness::start(container().store).await.unwrap();

    harness.submit(CounterIntent::Increment);
    let action = harness.expect_action().await.unwrap();
    assert!(matches!(action, CounterAction::ShowErrorMessage(_)));
    assert_eq!(harness.state(), CounterState::Loading);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_undo_without_history_shows_message() {
    let mut harness = StoreHarness::start(container().store).await.unwrap();

    harness.submit(CounterIntent::Tick(0));
    harness.expect_state(|s| *s == displaying(0, 0)).await.unwrap();
    harness.submit(CounterIntent::Undo);

    let action = harness.expect_action().await.unwrap();
    assert_eq!(
        action,
        CounterAction::ShowErrorMessage("nothing to undo".to_string())
    );
    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_crash_moves_to_error_state_and_resets_history() {
    let container = container();
    let mut harness = StoreHarness::start(container.store.clone()).await.unwrap();

    harness.submit(CounterIntent::Tick(3));
    harness.submit(CounterIntent::Increment);
    harness.expect_state(|s| *s == displaying(3, 1)).await.unwrap();
    assert_eq!(container.history.queue_size(), 1);

    harness.submit(CounterIntent::Crash);
    let state = harness
        .expect_state(|s| matches!(s, CounterState::Error(_)))
        .await
        .unwrap();
    match state {
        CounterState::Error(message) => assert!(message.contains("crashed")),
        other => panic!("unexpected state {other:?}"),
    }
    assert!(container.history.is_queue_empty());
    assert!(harness.store().is_running());

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_back_emits_go_back() {
    let mut harness = StoreHarness::start(container().store).await.unwrap();

    harness.submit(CounterIntent::Back);
    assert_eq!(harness.expect_action().await.unwrap(), CounterAction::GoBack);
    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_timer_starts_on_subscribe() {
    let container = CounterContainer::new(CounterConfig {
        timer_interval: Some(Duration::from_millis(10)),
        ..CounterConfig::default()
    })
    .unwrap();
    let store = container.store.clone();
    let mut harness = StoreHarness::start(store.clone()).await.unwrap();

    let _subscription = store.subscribe().await;
    harness
        .expect_state(|s| matches!(s, CounterState::DisplayingCounter { timer, .. } if *timer >= 2))
        .await
        .unwrap();
    assert!(store.jobs().is_active(TIMER_JOB));

    harness.stop().await.unwrap();
    assert!(store.jobs().is_empty());
}

#[tokio::test]
async fn test_store_does_not_restart() {
    let store = container().store;
    let harness = StoreHarness::start(store.clone()).await.unwrap();
    harness.stop().await.unwrap();

    assert!(matches!(
        store.start().await,
        Err(StoreError::RestartDisallowed)
    ));
    store.submit(CounterIntent::Increment);
    assert_eq!(store.dropped_intents(), 1);
}
