use std::time::{Duration, Instant};

/// Window focus changes reported by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activity {
    Blur,
    Focus,
}

/// Tracks whether the user is looking at the client.
///
/// The monitor only owns the away flag; the supervisor decides what a blur or
/// a return means for the session (inactivity timer, teardown, restart).
#[derive(Debug, Default)]
pub(crate) struct ActivityMonitor {
    away_since: Option<Instant>,
}

impl ActivityMonitor {
    pub(crate) fn is_away(&self) -> bool {
        self.away_since.is_some()
    }

    /// Mark the user away. A second blur keeps the original timestamp.
    pub(crate) fn blur(&mut self) {
        if self.away_since.is_none() {
            self.away_since = Some(Instant::now());
        }
    }

    /// Clear the away flag. Returns how long the user was away, or `None` if
    /// they never left.
    pub(crate) fn focus(&mut self) -> Option<Duration> {
        self.away_since.take().map(|since| since.elapsed())
    }
}
