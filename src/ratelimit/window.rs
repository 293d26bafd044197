//! Fixed-window counter state with a sticky block.

use chrono::{DateTime, TimeDelta, Utc};

/// Length of the counting window in milliseconds.
pub const WINDOW_LENGTH_MILLIS: u64 = 1000;

/// Per-key rate limit state.
///
/// Owned by a storage adapter; the admission engine only ever touches it
/// through [`WindowState::observe`] under the adapter's per-key lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// When the current window started
    pub window_start: DateTime<Utc>,
    /// Requests observed in the current window
    pub count: u64,
    /// The instant until which every request is rejected
    pub blocked_until: Option<DateTime<Utc>>,
}

impl WindowState {
    /// Create an empty state whose window starts at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            count: 0,
            blocked_until: None,
        }
    }

    /// Record one request and decide whether it is blocked.
    ///
    /// Returns the instant the key is blocked until, or `None` when the
    /// request is allowed. While a block is active the state is left
    /// untouched, so retrying never extends or shortens a block.
    pub fn observe(
        &mut self,
        now: DateTime<Utc>,
        window_millis: u64,
        max_requests: u64,
        block_millis: u64,
    ) -> Option<DateTime<Utc>> {
        if let Some(until) = self.blocked_until {
            if now < until {
                return Some(until);
            }
            self.blocked_until = None;
            self.start_window(now);
        } else if now.signed_duration_since(self.window_start) >= millis(window_millis) {
            self.start_window(now);
        }

        self.count = self.count.saturating_add(1);

        if self.count > max_requests {
            let until = add_millis(now, block_millis);
            self.blocked_until = Some(until);
            return Some(until);
        }

        None
    }

    /// Whether this state carries no information any more: the window has
    /// elapsed and no block is active.
    pub fn is_expired(&self, now: DateTime<Utc>, window_millis: u64) -> bool {
        match self.blocked_until {
            Some(until) if now < until => false,
            _ => now.signed_duration_since(self.window_start) >= millis(window_millis),
        }
    }

    fn start_window(&mut self, now: DateTime<Utc>) {
        self.window_start = now;
        self.count = 0;
    }
}

/// Convert unsigned milliseconds into a delta, saturating on overflow.
fn millis(ms: u64) -> TimeDelta {
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX)
}

/// Add unsigned milliseconds to an instant, saturating at the maximum date.
fn add_millis(at: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    at.checked_add_signed(millis(ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn test_allows_up_to_max() {
        let mut state = WindowState::new(at(0));

        for _ in 0..5 {
            assert_eq!(state.observe(at(0), 1000, 5, 1000), None);
        }
        assert_eq!(state.count, 5);
    }

    #[test]
    fn test_blocks_on_first_request_over_max() {
        let mut state = WindowState::new(at(0));
        for _ in 0..5 {
            state.observe(at(10), 1000, 5, 1000);
        }

        assert_eq!(state.observe(at(20), 1000, 5, 1000), Some(at(1020)));
        assert_eq!(state.blocked_until, Some(at(1020)));
    }

    #[test]
    fn test_blocked_attempts_do_not_mutate_state() {
        let mut state = WindowState::new(at(0));
        for _ in 0..3 {
            state.observe(at(0), 1000, 2, 1000);
        }
        let snapshot = state;

        assert_eq!(state.observe(at(500), 1000, 2, 1000), Some(at(1000)));
        assert_eq!(state.observe(at(999), 1000, 2, 1000), Some(at(1000)));
        assert_eq!(state, snapshot);
    }

    #[test]
    fn test_unblock_starts_fresh_window_with_count_one() {
        let mut state = WindowState::new(at(0));
        for _ in 0..3 {
            state.observe(at(0), 1000, 2, 1000);
        }

        assert_eq!(state.observe(at(1000), 1000, 2, 1000), None);
        assert_eq!(state.count, 1);
        assert_eq!(state.window_start, at(1000));
        assert_eq!(state.blocked_until, None);
    }

    #[test]
    fn test_window_rolls_over_after_window_length() {
        let mut state = WindowState::new(at(0));
        state.observe(at(0), 1000, 2, 1000);
        state.observe(at(100), 1000, 2, 1000);

        // Same window: over the limit
        let mut same_window = state;
        assert!(same_window.observe(at(999), 1000, 2, 1000).is_some());

        // Next window: counter reset
        assert_eq!(state.observe(at(1000), 1000, 2, 1000), None);
        assert_eq!(state.count, 1);
    }

    #[test]
    fn test_zero_max_blocks_every_fresh_window() {
        let mut state = WindowState::new(at(0));
        assert_eq!(state.observe(at(0), 1000, 0, 200), Some(at(200)));
    }

    #[test]
    fn test_is_expired() {
        let mut state = WindowState::new(at(0));
        state.observe(at(0), 1000, 1, 5000);
        assert!(!state.is_expired(at(999), 1000));
        assert!(state.is_expired(at(1000), 1000));

        // Blocked: kept until the block ends, even past the window
        state.observe(at(0), 1000, 1, 5000);
        assert!(!state.is_expired(at(4999), 1000));
        assert!(state.is_expired(at(5000), 1000));
    }

    #[test]
    fn test_add_millis_saturates() {
        assert_eq!(add_millis(at(0), u64::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
