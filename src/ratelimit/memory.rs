//! In-memory counter store with background eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::store::CounterStore;
use super::window::{duration_nanos, Window};
use crate::error::{RateWindowError, Result};

/// Counts bucketed by window, then by key.
#[derive(Debug, Default)]
struct StoreState {
    data: HashMap<Window, HashMap<String, u64>>,
    /// Number of `(window, key)` entries across all windows
    size: usize,
}

impl StoreState {
    fn inc(&mut self, key: &str, window: Window) {
        let counts = self.data.entry(window).or_default();
        match counts.get_mut(key) {
            Some(count) => *count += 1,
            None => {
                counts.insert(key.to_string(), 1);
                self.size += 1;
            }
        }
    }

    fn lookup(&self, key: &str, window: Window) -> u64 {
        self.data
            .get(&window)
            .and_then(|counts| counts.get(key))
            .copied()
            .unwrap_or(0)
    }

    /// Drop every window that started before `cutoff_nanos`.
    fn evict_before(&mut self, cutoff_nanos: i64) -> usize {
        let mut removed = 0;
        self.data.retain(|window, counts| {
            if window.start_nanos() < cutoff_nanos {
                removed += counts.len();
                false
            } else {
                true
            }
        });
        self.size -= removed;
        removed
    }
}

/// Handle to the background eviction task.
struct Flusher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// In-memory counter store.
///
/// All counts live behind a single reader/writer lock: lookups share it,
/// while increments and eviction sweeps take it exclusively. Windows whose
/// start is older than `now - 2 * expiration_time` are eligible for
/// eviction and are removed by a background task every `flush_interval`.
pub struct MemoryCounterStore {
    state: Arc<RwLock<StoreState>>,
    expiration_time: Duration,
    flusher: Mutex<Option<Flusher>>,
}

impl MemoryCounterStore {
    /// Create a new store and spawn its eviction task.
    ///
    /// Fails with a configuration error when called outside a Tokio runtime.
    pub fn new(expiration_time: Duration, flush_interval: Duration) -> Result<Self> {
        if flush_interval.is_zero() {
            return Err(RateWindowError::Config(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|e| {
            RateWindowError::Config(format!("eviction task needs a Tokio runtime: {}", e))
        })?;

        let store = Self::without_flusher(expiration_time)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(run_flusher(
            Arc::clone(&store.state),
            expiration_time,
            flush_interval,
            shutdown_rx,
        ));

        info!(
            expiration_time = ?expiration_time,
            flush_interval = ?flush_interval,
            "Started counter store eviction task"
        );

        *store.flusher.lock() = Some(Flusher { shutdown, handle });
        Ok(store)
    }

    /// Create a new store without a background eviction task.
    ///
    /// Expired windows are only removed by explicit calls to
    /// [`flush_expired`](Self::flush_expired).
    pub fn without_flusher(expiration_time: Duration) -> Result<Self> {
        if expiration_time.is_zero() {
            return Err(RateWindowError::Config(
                "expiration time must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            expiration_time,
            flusher: Mutex::new(None),
        })
    }

    /// Get the configured expiration time.
    pub fn expiration_time(&self) -> Duration {
        self.expiration_time
    }

    /// Run one eviction sweep now.
    ///
    /// Returns the number of `(window, key)` entries removed.
    pub fn flush_expired(&self) -> usize {
        self.flush_expired_at(Utc::now())
    }

    /// Run one eviction sweep as if the current time were `now`.
    pub fn flush_expired_at(&self, now: DateTime<Utc>) -> usize {
        flush(&self.state, self.expiration_time, now)
    }

    /// Stop the background eviction task and wait for it to finish.
    ///
    /// Calling this more than once, or on a store without a flusher, is a no-op.
    pub async fn shutdown(&self) {
        let flusher = self.flusher.lock().take();
        if let Some(flusher) = flusher {
            let _ = flusher.shutdown.send(true);
            let _ = flusher.handle.await;
            info!("Stopped counter store eviction task");
        }
    }

    /// Whether a background eviction task is currently running.
    pub fn has_flusher(&self) -> bool {
        self.flusher
            .lock()
            .as_ref()
            .map(|f| !f.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for MemoryCounterStore {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.get_mut().take() {
            flusher.handle.abort();
        }
    }
}

impl std::fmt::Debug for MemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCounterStore")
            .field("expiration_time", &self.expiration_time)
            .field("size", &self.state.read().size)
            .finish()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn inc(&self, key: &str, window: Window) -> Result<()> {
        self.state.write().inc(key, window);
        Ok(())
    }

    async fn get(&self, key: &str, previous: Window, current: Window) -> Result<(u64, u64)> {
        let state = self.state.read();
        Ok((state.lookup(key, previous), state.lookup(key, current)))
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.state.read().size)
    }
}

fn flush(state: &RwLock<StoreState>, expiration_time: Duration, now: DateTime<Utc>) -> usize {
    let horizon = duration_nanos(expiration_time.saturating_mul(2));
    let cutoff = Window::starting_at(now).start_nanos().saturating_sub(horizon);

    let removed = state.write().evict_before(cutoff);
    if removed > 0 {
        debug!(removed, cutoff_nanos = cutoff, "Evicted expired counter windows");
    } else {
        trace!(cutoff_nanos = cutoff, "No expired counter windows");
    }
    removed
}

async fn run_flusher(
    state: Arc<RwLock<StoreState>>,
    expiration_time: Duration,
    flush_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush(&state, expiration_time, Utc::now());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
