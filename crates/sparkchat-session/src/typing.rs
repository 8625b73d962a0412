//! Ephemeral typing-presence state and its display summary.
//!
//! Entries are keyed by display name and carry the timestamp of the last
//! typing-start signal. A stop signal removes the entry; the recurring sweep
//! removes entries older than the expiry window, which bounds how long an
//! indicator lingers when a peer's stop signal was lost in transit.

use std::collections::HashMap;

/// Per-peer "is typing" timestamps (epoch milliseconds).
#[derive(Debug, Default)]
pub struct TypingState {
    users: HashMap<String, i64>,
}

impl TypingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an entry. Returns true if the set of typing names
    /// changed (i.e. the peer was not already present).
    pub fn set(&mut self, username: &str, timestamp: i64) -> bool {
        self.users.insert(username.to_string(), timestamp).is_none()
    }

    /// Remove an entry on an explicit stop signal. Returns true if present.
    pub fn remove(&mut self, username: &str) -> bool {
        self.users.remove(username).is_some()
    }

    /// Drop entries whose age exceeds the expiry window. Returns true if
    /// anything was removed.
    pub fn sweep(&mut self, now_ms: i64, expiry_ms: i64) -> bool {
        let before = self.users.len();
        self.users.retain(|_, ts| now_ms - *ts <= expiry_ms);
        self.users.len() != before
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Stable snapshot of currently-typing names (sorted).
    pub fn snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> = self.users.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Render a typing-state snapshot as an indicator line.
///
/// Pure function of the snapshot: `None` for nobody typing, otherwise the
/// usual one/two/many phrasing.
pub fn typing_summary(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{one} is typing...")),
        [a, b] => Some(format!("{a} and {b} are typing...")),
        [a, b, rest @ ..] => Some(format!("{a}, {b}, and {} others are typing...", rest.len())),
    }
}
