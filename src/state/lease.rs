//! Short-lived reservation of a node for a pod a simulation placed on it

use chrono::{DateTime, Utc};

use crate::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub provider_id: String,
    pub until: DateTime<Utc>,
}

impl Lease {
    pub fn new(provider_id: impl Into<String>, until: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.into(),
            until,
        }
    }

    /// Open until strictly after `until`
    pub fn is_open(&self, clock: &dyn Clock) -> bool {
        self.until > clock.now()
    }
}
