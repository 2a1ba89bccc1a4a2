use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::watch::alert::AlertState;

/// Pure admission rule: an alert frame is admitted when nothing was admitted
/// yet or more than `cooldown` has elapsed since the last admission.
pub(crate) fn admits(
    alert: AlertState,
    now: Instant,
    last_admitted: Option<Instant>,
    cooldown: Duration,
) -> bool {
    alert.is_alert()
        && last_admitted.is_none_or(|last| now.saturating_duration_since(last) > cooldown)
}

/// Rate limiter for snapshot persistence.
///
/// The check and the update of the last admission time happen under one lock,
/// so concurrent callers can never both be admitted inside one cooldown.
#[derive(Debug)]
pub(crate) struct SnapshotThrottler {
    cooldown: Duration,
    last_admitted: Mutex<Option<Instant>>,
}

impl SnapshotThrottler {
    pub(crate) fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_admitted: Mutex::new(None),
        }
    }

    pub(crate) fn try_admit(&self, alert: AlertState, now: Instant) -> bool {
        let mut last = match self.last_admitted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if admits(alert, now, *last, self.cooldown) {
            *last = Some(now);
            true
        } else {
            false
        }
    }
}
