use std::collections::BTreeMap;
use std::time::Duration;

use driveway_protocol::Actuator;

use crate::supervisor::Effect;

/// Every timer the supervisor runs. At most one of each kind is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum TimerKind {
    /// Liveness watchdog, restarted by every ping.
    Liveness,
    /// Delay before reconnecting after a teardown.
    Restart,
    /// Started on blur; tears everything down if focus does not return.
    Inactivity,
    /// Minimum time an actuator stays busy after its state echo.
    Busy(Actuator),
}

/// Bookkeeping for armed timers.
///
/// Each start hands out a fresh token. A fired timer only counts if its token
/// is still the armed one, so a sleep that was aborted too late (or one that
/// belonged to a previous session) cannot act on current state.
#[derive(Debug, Default)]
pub(crate) struct TimerBook {
    next_token: u64,
    armed: BTreeMap<TimerKind, u64>,
}

impl TimerBook {
    /// Arm `kind`, implicitly replacing any previous instance.
    pub(crate) fn start(&mut self, kind: TimerKind, after: Duration) -> Effect {
        self.next_token += 1;
        let token = self.next_token;
        self.armed.insert(kind, token);
        Effect::StartTimer { kind, after, token }
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) -> Option<Effect> {
        self.armed
            .remove(&kind)
            .map(|_| Effect::CancelTimer { kind })
    }

    pub(crate) fn cancel_all(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.armed)
            .into_keys()
            .map(|kind| Effect::CancelTimer { kind })
            .collect()
    }

    /// Disarm `kind` if `token` is the current instance. Returns whether the
    /// firing should be acted on.
    pub(crate) fn fire(&mut self, kind: TimerKind, token: u64) -> bool {
        if self.armed.get(&kind) == Some(&token) {
            self.armed.remove(&kind);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_replaces_previous_token() {
        let mut book = TimerBook::default();
        let Effect::StartTimer { token: first, .. } =
            book.start(TimerKind::Liveness, Duration::from_secs(1))
        else {
            panic!("expected StartTimer");
        };
        let Effect::StartTimer { token: second, .. } =
            book.start(TimerKind::Liveness, Duration::from_secs(1))
        else {
            panic!("expected StartTimer");
        };

        assert_ne!(first, second);
        assert!(!book.fire(TimerKind::Liveness, first));
        assert!(book.fire(TimerKind::Liveness, second));
        // Already consumed
        assert!(!book.fire(TimerKind::Liveness, second));
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut book = TimerBook::default();
        let Effect::StartTimer { token, .. } =
            book.start(TimerKind::Restart, Duration::from_secs(2))
        else {
            panic!("expected StartTimer");
        };
        assert_eq!(
            book.cancel(TimerKind::Restart),
            Some(Effect::CancelTimer {
                kind: TimerKind::Restart
            })
        );
        assert!(!book.fire(TimerKind::Restart, token));
        assert_eq!(book.cancel(TimerKind::Restart), None);
    }

    #[test]
    fn busy_timers_are_per_actuator() {
        let mut book = TimerBook::default();
        book.start(TimerKind::Busy(Actuator::Gate), Duration::from_secs(1));
        book.start(TimerKind::Busy(Actuator::Garage), Duration::from_secs(1));
        assert!(book.is_armed(TimerKind::Busy(Actuator::Gate)));
        assert!(book.is_armed(TimerKind::Busy(Actuator::Garage)));

        let cancelled = book.cancel_all();
        assert_eq!(cancelled.len(), 2);
        assert!(!book.is_armed(TimerKind::Busy(Actuator::Gate)));
    }
}
