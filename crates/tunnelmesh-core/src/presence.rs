//! Presence tracking for a tunnel.
//!
//! Participants announce themselves with periodic heartbeats. An entry
//! counts as active while `now - last_seen_at < ttl`; counting evicts the
//! rest, so the tracker never grows past the set of recently active users.

use crate::log::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Last heartbeat of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Participant id
    pub user_id: String,
    /// Time of the last heartbeat (unix ms)
    pub last_seen_at: Timestamp,
}

/// Heartbeat table keyed by user id.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    entries: HashMap<String, Timestamp>,
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat, replacing any earlier one for the same user.
    pub fn heartbeat(&mut self, user_id: impl Into<String>, now: Timestamp) {
        self.entries.insert(user_id.into(), now);
    }

    /// Count users seen within `ttl` of `now` and forget everyone else.
    pub fn active_count(&mut self, now: Timestamp, ttl: Duration) -> usize {
        let ttl = ttl_millis(ttl);
        self.entries
            .retain(|_, last_seen| now.saturating_sub(*last_seen) < ttl);
        self.entries.len()
    }

    /// Ids of active users, sorted. Evicts like [`Self::active_count`].
    pub fn active_users(&mut self, now: Timestamp, ttl: Duration) -> Vec<String> {
        self.active_count(now, ttl);
        let mut users: Vec<String> = self.entries.keys().cloned().collect();
        users.sort();
        users
    }

    /// All entries currently held, without evicting anything.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .entries
            .iter()
            .map(|(user_id, last_seen_at)| PresenceEntry {
                user_id: user_id.clone(),
                last_seen_at: *last_seen_at,
            })
            .collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
