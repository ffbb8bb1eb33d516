//! Named background jobs tied to the store's lifetime.
//!
//! Plugins and reducers launch long-running work (timers, subscriptions to
//! repositories) and register it under a name so it can be replaced or
//! cancelled later:
//!
//! ```ignore
//! ctx.launch_job("timer", async move {
//!     loop {
//!         tokio::time::sleep(Duration::from_secs(1)).await;
//!         ctx.submit(Intent::Tick);
//!     }
//! })
//! .await;
//!
//! // later
//! ctx.cancel_job("timer");
//! ```
//!
//! # Guarantees
//!
//! - Replacing a job stops the previous one, and waits for it to finish,
//!   before the replacement is spawned. Two jobs under one name never run
//!   at the same time.
//! - Finished jobs are pruned whenever a job is registered.
//! - Every job is aborted, and awaited, when the store stops.

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Registry of named background jobs.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, JoinHandle<()>>,
    replacing: Mutex<()>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            replacing: Mutex::new(()),
        }
    }

    /// Store an already running `job` under `name`, stopping any job
    /// previously registered under the same name.
    pub async fn register(&self, name: impl Into<String>, job: JoinHandle<()>) {
        self.replace(name, move || job).await;
    }

    /// Stop the job registered under `name`, wait for it to finish, then
    /// call `spawn` and store the new handle.
    ///
    /// Replacements are serialized, so concurrent callers for the same name
    /// cannot end up with overlapping jobs.
    pub async fn replace<F>(&self, name: impl Into<String>, spawn: F)
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let name = name.into();
        let _replacing = self.replacing.lock().await;

        self.jobs.retain(|_, job| !job.is_finished());
        if let Some((_, previous)) = self.jobs.remove(&name) {
            debug!(job = %name, "replacing running job");
            previous.abort();
            settle(&name, previous).await;
        }

        debug!(job = %name, "registering job");
        self.jobs.insert(name, spawn());
    }

    /// Abort and remove the job registered under `name`.
    ///
    /// Returns `true` if a job was registered. Absent names are a no-op.
    pub fn cancel(&self, name: &str) -> bool {
        match self.jobs.remove(name) {
            Some((_, job)) => {
                job.abort();
                debug!(job = name, "cancelled job");
                true
            }
            None => false,
        }
    }

    /// Abort every registered job and wait until all of them have finished.
    pub async fn cancel_all(&self) {
        let _replacing = self.replacing.lock().await;
        let names: Vec<String> = self.jobs.iter().map(|entry| entry.key().clone()).collect();
        let mut pending = Vec::with_capacity(names.len());
        for name in names {
            if let Some((name, job)) = self.jobs.remove(&name) {
                job.abort();
                pending.push((name, job));
            }
        }

        for (name, job) in pending {
            settle(&name, job).await;
        }
    }

    /// Whether a job named `name` is registered and still running.
    pub fn is_active(&self, name: &str) -> bool {
        self.jobs
            .get(name)
            .map(|job| !job.is_finished())
            .unwrap_or(false)
    }

    /// Number of registered jobs, finished or not.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no jobs are registered.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Names of all registered jobs (unordered).
    pub fn names(&self) -> Vec<String> {
        self.jobs.iter().map(|entry| entry.key().clone()).collect()
    }
}

async fn settle(name: &str, job: JoinHandle<()>) {
    if let Err(e) = job.await {
        if e.is_panic() {
            warn!(job = %name, "job panicked before cancellation");
        }
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_count", &self.jobs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    // The guard exists before the task is first polled, so aborting an
    // unpolled task still flips the flag.
    fn forever(flag: Arc<AtomicBool>) -> JoinHandle<()> {
        let guard = SetOnDrop(flag);
        tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        })
    }

    #[tokio::test]
    async fn test_register_replaces_and_aborts_previous() {
        let registry = JobRegistry::new();
        let first_dropped = Arc::new(AtomicBool::new(false));
        let second_dropped = Arc::new(AtomicBool::new(false));

        registry.register("timer", forever(first_dropped.clone())).await;
        registry.register("timer", forever(second_dropped.clone())).await;

        assert_eq!(registry.len(), 1);
        assert!(first_dropped.load(Ordering::SeqCst));
        assert!(!second_dropped.load(Ordering::SeqCst));
        assert!(registry.is_active("timer"));
    }

    #[tokio::test]
    async fn test_replacement_starts_after_previous_job_released_its_resources() {
        let registry = JobRegistry::new();
        let resource = Arc::new(Mutex::new(()));

        let held = resource.clone().lock_owned().await;
        registry
            .register(
                "sync",
                tokio::spawn(async move {
                    let _held = held;
                    std::future::pending::<()>().await;
                }),
            )
            .await;

        let (tx, rx) = oneshot::channel();
        let contended = resource.clone();
        registry
            .replace("sync", move || {
                tokio::spawn(async move {
                    let _ = tx.send(contended.try_lock().is_ok());
                })
            })
            .await;

        assert!(rx.await.unwrap(), "previous job still held the resource");
    }

    #[tokio::test]
    async fn test_concurrent_replacements_never_overlap() {
        let registry = Arc::new(JobRegistry::new());
        let resource = Arc::new(Mutex::new(()));
        let overlaps = Arc::new(AtomicBool::new(false));

        let mut replacers = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let resource = resource.clone();
            let overlaps = overlaps.clone();
            replacers.push(tokio::spawn(async move {
                registry
                    .replace("worker", move || {
                        tokio::spawn(async move {
                            match resource.try_lock() {
                                Ok(_held) => std::future::pending::<()>().await,
                                Err(_) => overlaps.store(true, Ordering::SeqCst),
                            }
                        })
                    })
                    .await;
            }));
        }
        for replacer in replacers {
            replacer.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!overlaps.load(Ordering::SeqCst));
        assert_eq!(registry.len(), 1);
        registry.cancel_all().await;
    }

    #[tokio::test]
    async fn test_register_prunes_finished_jobs() {
        let registry = JobRegistry::new();
        registry.register("once", tokio::spawn(async {})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let dropped = Arc::new(AtomicBool::new(false));
        registry.register("other", forever(dropped)).await;

        assert_eq!(registry.names(), vec!["other".to_string()]);
        registry.cancel_all().await;
    }

    #[tokio::test]
    async fn test_cancel() {
        let registry = JobRegistry::new();
        let dropped = Arc::new(AtomicBool::new(false));
        registry.register("sync", forever(dropped.clone())).await;

        assert!(registry.cancel("sync"));
        assert!(!registry.cancel("sync"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(dropped.load(Ordering::SeqCst));
        assert!(registry.is_empty());
        assert!(!registry.is_active("sync"));
    }

    #[tokio::test]
    async fn test_cancel_absent_is_noop() {
        let registry = JobRegistry::new();
        assert!(!registry.cancel("missing"));
    }

    #[tokio::test]
    async fn test_cancel_all_waits_for_every_job() {
        let registry = JobRegistry::new();
        let flags: Vec<_> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();
        for (i, flag) in flags.iter().enumerate() {
            registry.register(format!("job-{i}"), forever(flag.clone())).await;
        }

        registry.cancel_all().await;

        assert!(registry.is_empty());
        assert!(flags.iter().all(|flag| flag.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn test_finished_job_is_not_active() {
        let registry = JobRegistry::new();
        registry.register("once", tokio::spawn(async {})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(registry.names(), vec!["once".to_string()]);
        assert!(!registry.is_active("once"));
    }
}
