//! "Something relevant changed" timestamp for the disruption engine

use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

use crate::clock::SharedClock;

/// Monotonically bumped consolidation timestamp
///
/// Guarded by its own lock so readers never queue behind the main cache lock.
pub struct ConsolidationClock {
    state: RwLock<Option<DateTime<Utc>>>,
    timeout: Duration,
    clock: SharedClock,
}

impl ConsolidationClock {
    pub fn new(clock: SharedClock, timeout: std::time::Duration) -> Self {
        Self {
            state: RwLock::new(None),
            timeout: Duration::from_std(timeout).unwrap_or_else(|_| Duration::minutes(5)),
            clock,
        }
    }

    /// Record that the cluster may have become consolidatable
    pub fn mark_unconsolidated(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        *self.state.write().expect("consolidation state lock poisoned") = Some(now);
        now
    }

    /// Last change, force-refreshed once older than the timeout
    pub fn state(&self) -> DateTime<Utc> {
        let state = *self.state.read().expect("consolidation state lock poisoned");
        match state {
            Some(t) if self.clock.since(t) < self.timeout => t,
            _ => self.mark_unconsolidated(),
        }
    }

    pub fn reset(&self) {
        *self.state.write().expect("consolidation state lock poisoned") = None;
    }
}
