use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, TimeZone};

/// Canonical dedup key for an alarm occurrence: the trigger instant as UTC
/// Unix milliseconds. Two representations of the same instant in different
/// zones produce the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OccurrenceKey(i64);

impl OccurrenceKey {
    pub fn from_instant<Tz: TimeZone>(instant: &DateTime<Tz>) -> Self {
        Self(instant.timestamp_millis())
    }
}

impl fmt::Display for OccurrenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "occurrence@{}", self.0)
    }
}

/// Occurrences already handled during this session.
///
/// Lives exactly as long as the session that owns it and is never persisted:
/// a restart inside the tolerance window can fire the same occurrence again.
/// Entries are never evicted; one occurrence per day keeps growth bounded.
#[derive(Debug, Default)]
pub struct OccurrenceTracker {
    handled: HashSet<OccurrenceKey>,
}

impl OccurrenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn has_handled(&self, key: OccurrenceKey) -> bool {
        self.handled.contains(&key)
    }

    #[cfg(test)]
    pub fn mark_handled(&mut self, key: OccurrenceKey) {
        self.handled.insert(key);
    }

    /// Check-and-mark in one step. Returns `true` only for the call that
    /// first records `key`.
    pub fn claim(&mut self, key: OccurrenceKey) -> bool {
        self.handled.insert(key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.handled.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.handled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use chrono_tz::America::New_York;

    use super::*;

    fn key_at(hour: u32) -> OccurrenceKey {
        OccurrenceKey::from_instant(&Utc.with_ymd_and_hms(2026, 6, 10, hour, 0, 0).unwrap())
    }

    #[test]
    fn fresh_tracker_has_handled_nothing() {
        let tracker = OccurrenceTracker::new();
        assert!(!tracker.has_handled(key_at(8)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn marking_twice_is_idempotent() {
        let mut tracker = OccurrenceTracker::new();
        tracker.mark_handled(key_at(8));
        tracker.mark_handled(key_at(8));
        assert!(tracker.has_handled(key_at(8)));
        assert!(!tracker.has_handled(key_at(9)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn claim_succeeds_once_per_key() {
        let mut tracker = OccurrenceTracker::new();
        assert!(tracker.claim(key_at(8)));
        assert!(!tracker.claim(key_at(8)));
        assert!(tracker.claim(key_at(9)));
    }

    #[test]
    fn key_is_independent_of_timezone_representation() {
        let utc = Utc.with_ymd_and_hms(2026, 6, 10, 12, 0, 0).unwrap();
        let local = utc.with_timezone(&New_York);
        assert_eq!(OccurrenceKey::from_instant(&utc), OccurrenceKey::from_instant(&local));

        let mut tracker = OccurrenceTracker::new();
        tracker.mark_handled(OccurrenceKey::from_instant(&local));
        assert!(tracker.has_handled(OccurrenceKey::from_instant(&utc)));
    }
}
