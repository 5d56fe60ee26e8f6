//! Eligibility window for the time-locked Spirit trial
//!
//! Pure computation, cheap enough to run on every countdown tick. The engine
//! does not own the timer.

use crate::types::Timestamp;
use serde::{Deserialize, Serialize};

/// Lock derived from a record's mint time and the configured duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLockWindow {
    pub created_at: Timestamp,
    pub duration_seconds: u64,
}

impl TimeLockWindow {
    pub fn new(created_at: Timestamp, duration_seconds: u64) -> Self {
        Self {
            created_at,
            duration_seconds,
        }
    }

    /// Saturates at `Timestamp::MAX`
    pub fn unlock_at(&self) -> Timestamp {
        self.created_at.saturating_add(self.duration_seconds)
    }

    pub fn evaluate(&self, now: Timestamp) -> TimeLockStatus {
        evaluate(Some(self.created_at), self.duration_seconds, now)
    }
}

/// Result of evaluating the gate at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLockStatus {
    /// `None` while the record's creation time is unknown
    pub unlock_at: Option<Timestamp>,
    /// `None` while the record's creation time is unknown, never a misleading zero
    pub remaining_seconds: Option<u64>,
    pub eligible: bool,
}

impl TimeLockStatus {
    /// Gate state before the record identity is resolved
    pub fn unknown() -> Self {
        Self {
            unlock_at: None,
            remaining_seconds: None,
            eligible: false,
        }
    }
}

/// Evaluate the gate.
///
/// `eligible = (now - created_at) >= duration`. A clock that reads earlier
/// than `created_at` counts as zero elapsed time.
pub fn evaluate(created_at: Option<Timestamp>, duration_seconds: u64, now: Timestamp) -> TimeLockStatus {
    let Some(created_at) = created_at else {
        return TimeLockStatus::unknown();
    };

    let elapsed = now.saturating_sub(created_at);
    TimeLockStatus {
        unlock_at: Some(created_at.saturating_add(duration_seconds)),
        remaining_seconds: Some(duration_seconds.saturating_sub(elapsed)),
        eligible: elapsed >= duration_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Timestamp = 1_700_000_000;

    #[test]
    fn test_exactly_at_unlock() {
        let status = evaluate(Some(T), 3600, T + 3600);
        assert!(status.eligible);
        assert_eq!(status.remaining_seconds, Some(0));
        assert_eq!(status.unlock_at, Some(T + 3600));
    }

    #[test]
    fn test_partway() {
        let status = evaluate(Some(T), 3600, T + 1000);
        assert!(!status.eligible);
        assert_eq!(status.remaining_seconds, Some(2600));
    }

    #[test]
    fn test_unknown_creation_fails_closed() {
        let status = evaluate(None, 3600, T);
        assert_eq!(status, TimeLockStatus::unknown());
    }

    #[test]
    fn test_clock_behind_creation() {
        let status = evaluate(Some(T), 60, T - 30);
        assert!(!status.eligible);
        assert_eq!(status.remaining_seconds, Some(60));
    }

    #[test]
    fn test_zero_duration_is_open() {
        assert!(evaluate(Some(T), 0, T).eligible);
    }

    #[test]
    fn test_window_matches_free_function() {
        let window = TimeLockWindow::new(T, 900);
        assert_eq!(window.unlock_at(), T + 900);
        assert_eq!(window.evaluate(T + 100), evaluate(Some(T), 900, T + 100));
    }

    #[test]
    fn test_window_keeps_creation_time_when_unlock_saturates() {
        let window = TimeLockWindow::new(T, u64::MAX);
        assert_eq!(window.created_at, T);
        assert_eq!(window.unlock_at(), u64::MAX);

        let status = window.evaluate(T + 10);
        assert!(!status.eligible);
        assert_eq!(status.remaining_seconds, Some(u64::MAX - 10));
    }
}
