//! Distributed execution lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A time-bounded lock entry shared by every process instance.
///
/// The lease is held while `locked_until` is in the future. Releasing it
/// never clears the row; it only moves `locked_until` back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub locked_until: DateTime<Utc>,
}

impl LeaseRecord {
    /// Whether the lease still excludes other holders at `now`.
    #[must_use]
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until > now
    }
}
