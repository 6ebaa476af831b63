//! Deadline tracking for sessions and subprocesses.
//!
//! The event loop bounds its poll timeout and sweeps all containers on each
//! iteration, so a deadline is a plain `Instant` checked against `now`
//! rather than an entry in a timer wheel.

use std::{
    fmt,
    time::{Duration, Instant},
};

/// An optional deadline with a configured duration, re-armed on activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutContainer {
    duration: Duration,
    deadline: Option<Instant>,
}

impl TimeoutContainer {
    /// armed `duration` from now
    pub fn new(duration: Duration) -> TimeoutContainer {
        TimeoutContainer {
            duration,
            deadline: Some(Instant::now() + duration),
        }
    }

    /// carries a duration but no armed deadline
    pub fn new_empty(duration: Duration) -> TimeoutContainer {
        TimeoutContainer {
            duration,
            deadline: None,
        }
    }

    /// re-arm the deadline `duration` from now
    pub fn reset(&mut self) {
        self.deadline = Some(Instant::now() + self.duration);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// change the configured duration and re-arm
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
        self.reset();
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// time left before expiry, used to bound the poll timeout;
    /// `None` when unarmed, `Some(ZERO)` when already past due
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// disarm after the deadline fired, so a single expiry is acted on once
    pub fn triggered(&mut self) {
        self.deadline = None;
    }
}

impl fmt::Display for TimeoutContainer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}s", self.duration.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry() {
        let now = Instant::now();
        let mut container = TimeoutContainer::new(Duration::from_secs(5));
        assert!(!container.is_expired(now));
        assert!(container.is_expired(now + Duration::from_secs(6)));

        container.cancel();
        assert!(!container.is_expired(now + Duration::from_secs(60)));

        container.reset();
        assert!(container.is_armed());
        assert!(!container.is_expired(Instant::now()));
    }

    #[test]
    fn triggered_disarms() {
        let mut container = TimeoutContainer::new(Duration::from_secs(0));
        let later = Instant::now() + Duration::from_millis(1);
        assert!(container.is_expired(later));
        container.triggered();
        assert!(!container.is_expired(later));
    }

    #[test]
    fn remaining_saturates() {
        let now = Instant::now();
        let container = TimeoutContainer::new(Duration::from_secs(2));
        let remaining = container.remaining(now).unwrap();
        assert!(remaining <= Duration::from_secs(2));
        assert_eq!(
            container.remaining(now + Duration::from_secs(10)),
            Some(Duration::ZERO)
        );
        assert_eq!(TimeoutContainer::new_empty(Duration::from_secs(1)).remaining(now), None);
    }
}
