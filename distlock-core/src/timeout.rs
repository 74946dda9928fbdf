//! Acquisition timeouts.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// How long an acquisition may wait.
///
/// `try_acquire` defaults to [`Timeout::ZERO`] (a single probe) and `acquire`
/// defaults to [`Timeout::INFINITE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeout(Option<Duration>);

impl Timeout {
    /// Probe once and never wait.
    pub const ZERO: Timeout = Timeout(Some(Duration::ZERO));

    /// Wait until acquired or cancelled.
    pub const INFINITE: Timeout = Timeout(None);

    /// Finite timeout.
    pub const fn from_duration(duration: Duration) -> Self {
        Timeout(Some(duration))
    }

    /// Finite timeout in milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Timeout(Some(Duration::from_millis(millis)))
    }

    /// Finite timeout in seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Timeout(Some(Duration::from_secs(secs)))
    }

    /// The finite duration, or `None` when infinite.
    pub fn duration(&self) -> Option<Duration> {
        self.0
    }

    /// Whether this is a single probe.
    pub fn is_zero(&self) -> bool {
        self.0 == Some(Duration::ZERO)
    }

    /// Whether this waits forever.
    pub fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    /// Deadline measured from `start`, or `None` when infinite.
    ///
    /// Durations too large to represent are treated as infinite.
    pub fn deadline_from(&self, start: Instant) -> Option<Instant> {
        self.0.and_then(|d| start.checked_add(d))
    }

    /// Duration used in timeout errors (`Duration::MAX` when infinite).
    pub fn as_reported(&self) -> Duration {
        self.0.unwrap_or(Duration::MAX)
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout(Some(duration))
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        Timeout(duration)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(d) => write!(f, "{:?}", d),
            None => write!(f, "infinite"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_and_infinite() {
        assert!(Timeout::ZERO.is_zero());
        assert!(!Timeout::ZERO.is_infinite());
        assert!(Timeout::INFINITE.is_infinite());
        assert_eq!(Timeout::INFINITE.duration(), None);
        assert_eq!(Timeout::default(), Timeout::ZERO);
    }

    #[test]
    fn test_deadline() {
        let start = Instant::now();
        assert_eq!(
            Timeout::from_secs(2).deadline_from(start),
            Some(start + Duration::from_secs(2))
        );
        assert_eq!(Timeout::INFINITE.deadline_from(start), None);
        assert_eq!(Timeout::from(None).to_string(), "infinite");
    }
}
