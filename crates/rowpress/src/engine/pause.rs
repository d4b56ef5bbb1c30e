use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;

/// Ephemeral per-batch pause markers.
///
/// Flags expire after the configured TTL so a caller that paused and then
/// crashed cannot block a batch forever. They live in process memory only;
/// the durable record of a pause is the `paused` rows in the store.
#[derive(Clone)]
pub struct PauseFlags {
    flags: Cache<String, DateTime<Utc>>,
}

impl PauseFlags {
    pub fn new(ttl: Duration) -> Self {
        Self {
            flags: Cache::builder().time_to_live(ttl).build(),
        }
    }

    pub fn set(&self, batch_id: &str) {
        self.flags.insert(batch_id.to_string(), Utc::now());
    }

    pub fn clear(&self, batch_id: &str) {
        self.flags.invalidate(batch_id);
    }

    pub fn is_paused(&self, batch_id: &str) -> bool {
        self.paused_at(batch_id).is_some()
    }

    /// When the flag was set, if it is still live.
    pub fn paused_at(&self, batch_id: &str) -> Option<DateTime<Utc>> {
        self.flags.get(batch_id)
    }
}

impl std::fmt::Debug for PauseFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseFlags")
            .field("time_to_live", &self.flags.policy().time_to_live())
            .finish()
    }
}
