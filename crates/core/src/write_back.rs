//! Coalescing write-back cache.
//!
//! An in-memory owner marks itself dirty after every mutation; the cache turns
//! bursts of marks into a single [`Snapshot::persist`] call once the debounce
//! window elapses. A periodic safety-net flush and a forced flush on shutdown
//! bound how much unwritten state can be lost.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// State that knows how to write itself to durable storage.
pub trait Snapshot: Send + Sync + 'static {
    fn persist(&self) -> Result<()>;

    fn label(&self) -> &str {
        "snapshot"
    }
}

pub struct WriteBack<S: Snapshot> {
    inner: Arc<WriteBackInner<S>>,
}

impl<S: Snapshot> Clone for WriteBack<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct WriteBackInner<S: Snapshot> {
    target: Arc<S>,
    debounce: Duration,
    dirty: AtomicBool,
    timer_armed: AtomicBool,
    write_lock: Mutex<()>,
    flushes: AtomicU64,
    shutdown: CancellationToken,
    safety_net: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Snapshot> WriteBack<S> {
    pub fn new(target: Arc<S>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(WriteBackInner {
                target,
                debounce,
                dirty: AtomicBool::new(false),
                timer_armed: AtomicBool::new(false),
                write_lock: Mutex::new(()),
                flushes: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                safety_net: Mutex::new(None),
            }),
        }
    }

    pub fn target(&self) -> &Arc<S> {
        &self.inner.target
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Number of persist attempts made so far.
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Acquire)
    }

    /// Record a mutation and arm the debounce timer if it is not already
    /// running. Outside a tokio runtime the write happens immediately.
    pub fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::Release);

        if self.inner.shutdown.is_cancelled() {
            self.inner.flush_if_dirty();
            return;
        }

        if self.inner.timer_armed.swap(true, Ordering::AcqRel) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(inner.debounce) => {}
                        _ = inner.shutdown.cancelled() => {}
                    }
                    inner.timer_armed.store(false, Ordering::Release);
                    inner.flush_if_dirty();
                });
            }
            Err(_) => {
                self.inner.timer_armed.store(false, Ordering::Release);
                self.inner.flush_if_dirty();
            }
        }
    }

    /// Write now regardless of the dirty flag.
    pub fn flush_now(&self) -> bool {
        self.inner.flush()
    }

    pub fn flush_if_dirty(&self) -> bool {
        self.inner.flush_if_dirty()
    }

    /// Spawn the periodic flush. Calling it twice keeps the first timer.
    pub fn start_safety_net(&self, every: Duration) {
        let mut slot = self
            .inner
            .safety_net
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if inner.flush_if_dirty() {
                            debug!(target_label = inner.target.label(), "Safety-net flush wrote pending changes");
                        }
                    }
                }
            }
        }));
    }

    /// Stop timers and write any pending changes.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .safety_net
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.flush_if_dirty();
    }
}

impl<S: Snapshot> WriteBackInner<S> {
    fn flush_if_dirty(&self) -> bool {
        if !self.dirty.load(Ordering::Acquire) {
            return false;
        }
        self.flush()
    }

    fn flush(&self) -> bool {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.dirty.store(false, Ordering::Release);
        self.flushes.fetch_add(1, Ordering::AcqRel);

        match self.target.persist() {
            Ok(()) => true,
            Err(err) => {
                // Keep the dirty bit so the safety net retries.
                self.dirty.store(true, Ordering::Release);
                error!(
                    target_label = self.target.label(),
                    error = %format!("{err:#}"),
                    "Failed to persist snapshot; in-memory state remains authoritative"
                );
                false
            }
        }
    }
}
