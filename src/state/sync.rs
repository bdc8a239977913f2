//! First-sync detection and unsynced-duration reporting

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::error;

use crate::clock::SharedClock;
use crate::metrics::StateMetrics;

/// True when every name the store knows is also tracked in memory
pub fn covers<'a>(tracked: &HashSet<String>, authoritative: impl IntoIterator<Item = &'a str>) -> bool {
    authoritative.into_iter().all(|name| tracked.contains(name))
}

#[derive(Debug, Default)]
struct Unsynced {
    since: Option<DateTime<Utc>>,
    last_log: Option<DateTime<Utc>>,
}

/// One-way "has synced once" latch plus unsynced bookkeeping
pub struct SyncTracker {
    has_synced: AtomicBool,
    unsynced: Mutex<Unsynced>,
    log_after: Duration,
    log_interval: Duration,
    clock: SharedClock,
}

impl SyncTracker {
    pub fn new(clock: SharedClock, log_after: std::time::Duration, log_interval: std::time::Duration) -> Self {
        Self {
            has_synced: AtomicBool::new(false),
            unsynced: Mutex::new(Unsynced::default()),
            log_after: Duration::from_std(log_after).unwrap_or_else(|_| Duration::seconds(30)),
            log_interval: Duration::from_std(log_interval).unwrap_or_else(|_| Duration::seconds(10)),
            clock,
        }
    }

    pub fn has_synced(&self) -> bool {
        self.has_synced.load(Ordering::Acquire)
    }

    pub fn latch(&self) {
        self.has_synced.store(true, Ordering::Release);
    }

    /// Publish the outcome of a sync check
    pub fn record(&self, synced: bool, metrics: &StateMetrics) {
        metrics.set_synced(synced);

        let mut unsynced = self.unsynced.lock().expect("sync state lock poisoned");
        if synced {
            *unsynced = Unsynced::default();
            metrics.set_unsynced_time(std::time::Duration::ZERO);
            return;
        }

        let now = self.clock.now();
        let since = *unsynced.since.get_or_insert(now);
        let elapsed = now - since;
        let quiet = unsynced
            .last_log
            .map(|t| now - t > self.log_interval)
            .unwrap_or(true);
        if elapsed > self.log_after && quiet {
            unsynced.last_log = Some(now);
            error!(
                duration_secs = elapsed.num_seconds(),
                "cluster is waiting on sync for extended duration"
            );
        }
        metrics.set_unsynced_time(elapsed.to_std().unwrap_or_default());
    }

    /// When the last complaint was logged
    pub fn last_unsynced_log(&self) -> Option<DateTime<Utc>> {
        self.unsynced.lock().expect("sync state lock poisoned").last_log
    }

    pub fn reset(&self) {
        self.has_synced.store(false, Ordering::Release);
        *self.unsynced.lock().expect("sync state lock poisoned") = Unsynced::default();
    }
}
