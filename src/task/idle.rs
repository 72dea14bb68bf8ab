use crate::pool::ProgressInfo;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Time since the last sign of life of a running attempt.
///
/// Falls back to the attempt start when the callable never sent a
/// heartbeat, so long-running callables must heartbeat to avoid being
/// reported as stalled.
pub fn idle_duration(progress: &ProgressInfo, now: DateTime<Utc>) -> Option<Duration> {
    let last = progress.last_activity()?;
    Some((now - last).to_std().unwrap_or_default())
}

/// Tracks how long the whole system has had nothing queued or running
#[derive(Debug, Default, Clone)]
pub struct IdleTracker {
    idle_since: Option<DateTime<Utc>>,
    signalled: bool,
}

/// What one observation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTransition {
    None,
    /// Idle for longer than the window; reported once per idle period
    WindowExceeded { idle_for: Duration },
    /// Work appeared after a reported idle period
    Resumed,
}

impl IdleTracker {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            idle_since: Some(now),
            signalled: false,
        }
    }

    pub fn observe(&mut self, busy: bool, now: DateTime<Utc>, window: Duration) -> IdleTransition {
        if busy {
            self.idle_since = None;
            if std::mem::take(&mut self.signalled) {
                return IdleTransition::Resumed;
            }
            return IdleTransition::None;
        }

        let since = *self.idle_since.get_or_insert(now);
        let idle_for = (now - since).to_std().unwrap_or_default();
        if idle_for >= window && !self.signalled {
            self.signalled = true;
            return IdleTransition::WindowExceeded { idle_for };
        }
        IdleTransition::None
    }

    pub fn idle_since(&self) -> Option<DateTime<Utc>> {
        self.idle_since
    }
}
