//! # Debounced Trigger
//!
//! A coalescing background job. Each trigger owns one worker task that runs
//! the job; `trigger()` only records that a run is wanted. Any number of
//! signals arriving while a run is pending or in progress collapse into a
//! single follow-up run, so a trigger never queues more than one run and
//! never runs its job concurrently with itself.
//!
//! Runs are spaced at least `min_interval` apart, which batches bursts of
//! signals (e.g. many resource updates while the API server is slow).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Something that can be asked to run its job eventually
pub trait JobTrigger: Send + Sync + fmt::Debug {
    /// Request a run; coalesced with any run already pending
    fn trigger(&self);

    /// Stop the worker; further signals are ignored
    fn shutdown(&self);
}

/// Counters describing how a trigger has been used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStats {
    /// Number of `trigger()` calls
    pub triggered: u64,
    /// Calls that folded into an already pending run
    pub folded: u64,
    /// Completed job runs
    pub runs: u64,
}

struct TriggerInner {
    name: String,
    notify: Notify,
    pending: AtomicBool,
    shutdown: CancellationToken,
    triggered: AtomicU64,
    folded: AtomicU64,
    runs: AtomicU64,
}

/// Debounced, coalescing trigger backed by a dedicated worker task
#[derive(Clone)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Trigger {
    /// Spawns the worker task for `job`.
    ///
    /// Must be called from within a Tokio runtime. The worker stops when
    /// `shutdown()` is called or `parent` is cancelled.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        min_interval: Duration,
        parent: &CancellationToken,
        mut job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::new(TriggerInner {
            name: name.into(),
            notify: Notify::new(),
            pending: AtomicBool::new(false),
            shutdown: parent.child_token(),
            triggered: AtomicU64::new(0),
            folded: AtomicU64::new(0),
            runs: AtomicU64::new(0),
        });

        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut last_run: Option<Instant> = None;
            loop {
                tokio::select! {
                    biased;
                    () = worker.shutdown.cancelled() => break,
                    () = worker.notify.notified() => {}
                }

                if let Some(last) = last_run {
                    let next = last + min_interval;
                    if next > Instant::now() {
                        tokio::select! {
                            biased;
                            () = worker.shutdown.cancelled() => break,
                            () = tokio::time::sleep_until(next) => {}
                        }
                    }
                }

                // Signals from here on need another run
                worker.pending.store(false, Ordering::SeqCst);
                job().await;
                worker.runs.fetch_add(1, Ordering::SeqCst);
                last_run = Some(Instant::now());
            }
            debug!("Trigger {} stopped", worker.name);
        });

        Self { inner }
    }

    /// Name of the trigger
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot of the trigger counters
    pub fn stats(&self) -> TriggerStats {
        TriggerStats {
            triggered: self.inner.triggered.load(Ordering::SeqCst),
            folded: self.inner.folded.load(Ordering::SeqCst),
            runs: self.inner.runs.load(Ordering::SeqCst),
        }
    }
}

impl JobTrigger for Trigger {
    fn trigger(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.triggered.fetch_add(1, Ordering::SeqCst);
        if self.inner.pending.swap(true, Ordering::SeqCst) {
            self.inner.folded.fetch_add(1, Ordering::SeqCst);
        }
        // Stores at most one permit when the worker is busy
        self.inner.notify.notify_one();
    }

    fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}
