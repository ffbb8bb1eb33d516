//! Stress tests for the store runtime.
//!
//! These tests hammer the queue, the state lock and the action channel from
//! many tasks at once with random timing.

#[cfg(test)]
mod stress_tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::action::{ActionShareBehavior, Overflow};
    use crate::context::PipelineContext;
    use crate::plugins::{UndoRedoPlugin, Undoable};
    use crate::store::Store;

    const TIMEOUT: Duration = Duration::from_secs(20);

    async fn jitter() {
        let micros = fastrand::u64(0..500);
        tokio::time::sleep(Duration::from_micros(micros)).await;
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // ==========================================================================
    // Queue
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_producers_keep_per_producer_order() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 250;

        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        let store = Store::<usize, (usize, usize), ()>::builder(0)
            .reduce(move |ctx, (producer, seq)| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push((producer, seq));
                    ctx.update_state(|count| count + 1).await?;
                    Ok(())
                }
            })
            .build()
            .unwrap();
        store.start().await.unwrap();

        let mut producers = Vec::new();
        for producer in 0..PRODUCERS {
            let store = store.clone();
            producers.push(tokio::spawn(async move {
                for seq in 0..PER_PRODUCER {
                    store.submit((producer, seq));
                    if fastrand::u8(..) < 16 {
                        jitter().await;
                    }
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let states = store.states();
        wait_until(|| *states.borrow() == PRODUCERS * PER_PRODUCER).await;

        let log = log.lock().unwrap();
        let mut next: HashMap<usize, usize> = HashMap::new();
        for (producer, seq) in log.iter() {
            let expected = next.entry(*producer).or_insert(0);
            assert_eq!(seq, expected, "producer {producer} out of order");
            *expected += 1;
        }
        assert!(next.values().all(|count| *count == PER_PRODUCER));
        store.stop().await;
    }

    // ==========================================================================
    // State Lock
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jittered_concurrent_updates_are_linearizable() {
        const WORKERS: usize = 64;
        const UPDATES: usize = 20;

        let store = Store::<Vec<usize>, usize, ()>::builder(Vec::new())
            .with_state_capacity(WORKERS * UPDATES * 2)
            .reduce(|ctx: PipelineContext<Vec<usize>, usize, ()>, workers| async move {
                for worker in 0..workers {
                    let ctx_worker = ctx.clone();
                    ctx.launch(async move {
                        for _ in 0..UPDATES {
                            jitter().await;
                            ctx_worker
                                .update_state(|log| {
                                    let mut next = log.clone();
                                    next.push(worker);
                                    next
                                })
                                .await?;
                        }
                        Ok(())
                    });
                }
                Ok(())
            })
            .build()
            .unwrap();
        let mut commits = store.subscribe_states().await;
        store.start().await.unwrap();
        store.submit(WORKERS);

        // Every commit extends the previous one by exactly one entry.
        let mut previous: Vec<usize> = Vec::new();
        let target = WORKERS * UPDATES;
        while previous.len() < target {
            let next = tokio::time::timeout(TIMEOUT, commits.recv())
                .await
                .unwrap()
                .unwrap();
            if next.is_empty() {
                continue;
            }
            assert_eq!(next.len(), previous.len() + 1);
            assert_eq!(next[..previous.len()], previous[..]);
            previous = next;
        }

        let mut per_worker = vec![0usize; WORKERS];
        for worker in &previous {
            per_worker[*worker] += 1;
        }
        assert!(per_worker.iter().all(|count| *count == UPDATES));
        store.stop().await;
    }

    // ==========================================================================
    // Actions
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distribute_delivers_each_action_exactly_once() {
        const ACTIONS: usize = 500;
        const SUBSCRIBERS: usize = 4;

        let store = Store::<(), usize, usize>::builder(())
            .with_action_share_behavior(ActionShareBehavior::Distribute {
                buffer: 8,
                overflow: Overflow::Suspend,
            })
            .reduce(|ctx, count| async move {
                for action in 0..count {
                    ctx.emit_action(action).await?;
                }
                Ok(())
            })
            .build()
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let total = Arc::new(AtomicUsize::new(0));
        let mut subscribers = Vec::new();
        for _ in 0..SUBSCRIBERS {
            let mut actions = store.actions();
            let received = received.clone();
            let total = total.clone();
            subscribers.push(tokio::spawn(async move {
                while let Some(action) = actions.recv().await {
                    received.lock().unwrap().push(action);
                    if total.fetch_add(1, Ordering::SeqCst) + 1 >= ACTIONS {
                        break;
                    }
                    if fastrand::bool() {
                        jitter().await;
                    }
                }
            }));
        }

        store.start().await.unwrap();
        store.submit(ACTIONS);
        wait_until(|| total.load(Ordering::SeqCst) >= ACTIONS).await;

        let mut received = received.lock().unwrap().clone();
        received.sort_unstable();
        assert_eq!(received, (0..ACTIONS).collect::<Vec<_>>());

        store.stop().await;
        for subscriber in subscribers {
            subscriber.abort();
        }
    }

    // ==========================================================================
    // Lifecycle
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restart_cycles_under_load() {
        let store = Store::<u64, u64, ()>::builder(0)
            .reduce(|ctx, n| async move {
                jitter().await;
                ctx.update_state(|s| s + n).await?;
                Ok(())
            })
            .build()
            .unwrap();

        let producer = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..2_000 {
                    store.submit(1);
                    if fastrand::u8(..) < 32 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        for _ in 0..20 {
            let run = store.start().await.unwrap();
            tokio::time::sleep(Duration::from_millis(fastrand::u64(1..5))).await;
            run.stop().await;
            assert!(run.is_finished());
            assert!(!store.is_running());
        }
        producer.await.unwrap();

        // Processed intents are never counted twice.
        assert!(store.state() <= 2_000);
        assert!(store.jobs().is_empty());
    }

    // ==========================================================================
    // Undo/Redo
    // ==========================================================================

    struct Add(i64);

    #[async_trait]
    impl Undoable<i64, i64, ()> for Add {
        async fn redo(&self, ctx: &PipelineContext<i64, i64, ()>) -> Result<()> {
            let n = self.0;
            ctx.update_state(move |s| s + n).await?;
            Ok(())
        }

        async fn undo(&self, ctx: &PipelineContext<i64, i64, ()>) -> Result<()> {
            let n = self.0;
            ctx.update_state(move |s| s - n).await?;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_undo_redo_stays_consistent_with_concurrent_updates() {
        let history = Arc::new(UndoRedoPlugin::<Add>::new(16));
        let plugin = history.clone();
        let store = Store::<i64, i64, ()>::builder(0)
            .with_shared_plugin(history.clone())
            .reduce(move |ctx, op| {
                let history = plugin.clone();
                async move {
                    match op {
                        0 => {
                            let _ = history.undo(&ctx).await;
                        }
                        1 => {
                            let _ = history.redo(&ctx).await;
                        }
                        n => {
                            history.invoke(&ctx, Add(n), true).await?;
                        }
                    }
                    Ok(())
                }
            })
            .build()
            .unwrap();
        store.start().await.unwrap();

        for _ in 0..300 {
            let op = match fastrand::u8(0..3) {
                0 => 0,
                1 => 1,
                _ => fastrand::i64(2..10),
            };
            store.submit(op);
        }
        store.submit(i64::MAX / 4);

        let states = store.states();
        wait_until(|| *states.borrow() >= i64::MAX / 4).await;

        // The last intent recorded a new event, so the cursor is on it.
        let recorded = history.queue_size();
        assert!(recorded <= 16);
        assert_eq!(history.index(), Some(recorded - 1));
        store.stop().await;
        assert!(history.is_queue_empty());
    }
}
