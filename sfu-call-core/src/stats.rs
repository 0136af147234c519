//! Session statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters accumulated by one session
///
/// A rejoin reports the old session's counters to the SFU and merges them
/// into the replacement, so totals survive reconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Signaling RPCs sent
    pub rpcs_sent: u64,
    /// Signaling RPCs that failed
    pub rpcs_failed: u64,
    /// Subscriber offers answered
    pub offers_answered: u64,
    /// Publisher negotiations completed
    pub publisher_negotiations: u64,
    /// ICE restarts performed
    pub ice_restarts: u64,
    /// Reconnects this call went through
    pub reconnects: u64,
    /// First session of the call started at
    pub started_at: Option<DateTime<Utc>>,
}

impl SessionStats {
    /// Fresh counters starting now
    #[must_use]
    pub fn started_now() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Add another session's counters; the earlier start time wins
    pub fn merge(&mut self, other: &SessionStats) {
        self.rpcs_sent += other.rpcs_sent;
        self.rpcs_failed += other.rpcs_failed;
        self.offers_answered += other.offers_answered;
        self.publisher_negotiations += other.publisher_negotiations;
        self.ice_restarts += other.ice_restarts;
        self.reconnects += other.reconnects;
        self.started_at = match (self.started_at, other.started_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_merge_keeps_earliest_start() {
        let now = Utc::now();
        let mut current = SessionStats {
            rpcs_sent: 2,
            started_at: Some(now),
            ..SessionStats::default()
        };
        let previous = SessionStats {
            rpcs_sent: 5,
            reconnects: 1,
            started_at: Some(now - Duration::seconds(30)),
            ..SessionStats::default()
        };

        current.merge(&previous);
        assert_eq!(current.rpcs_sent, 7);
        assert_eq!(current.reconnects, 1);
        assert_eq!(current.started_at, previous.started_at);
    }

    #[test]
    fn test_merge_into_empty() {
        let mut current = SessionStats::default();
        current.merge(&SessionStats::started_now());
        assert!(current.started_at.is_some());
    }
}
