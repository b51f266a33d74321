//! When to cut a snapshot.

use serde::{Deserialize, Serialize};

/// Snapshot cadence. A snapshot is due when either threshold is reached;
/// zero disables that trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    pub every_events: u64,
    pub every_ms: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            every_events: 10_000,
            every_ms: 3_600_000,
        }
    }
}

impl SnapshotPolicy {
    pub fn due(&self, events_since_last: u64, ms_since_last: u64) -> bool {
        (self.every_events > 0 && events_since_last >= self.every_events)
            || (self.every_ms > 0 && ms_since_last >= self.every_ms)
    }
}
