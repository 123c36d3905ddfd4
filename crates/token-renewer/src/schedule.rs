//! When a credential is due and when it should next be looked at.
//!
//! Both functions are pure over `(expiration, before, now)` so they can be
//! checked without a clock. Arithmetic saturates: an overflowing renewal window
//! counts as "due now" and an underflowing check time clamps to the epoch.

use crate::model::{Kind, ObjectKey};
use std::time::{Duration, SystemTime};

/// Returns `true` when `now + before` has reached `expiration`.
///
/// The comparison is inclusive: a credential whose renewal threshold lands
/// exactly on its expiration is due.
pub fn is_due(expiration: SystemTime, before: Duration, now: SystemTime) -> bool {
    match now.checked_add(before) {
        Some(threshold) => expiration <= threshold,
        None => true,
    }
}

/// When to look at a credential next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextCheck {
    /// `expiration - before`.
    pub at: SystemTime,
    /// Delay from `now` until `at`, zero if `at` is already past.
    pub requeue_after: Duration,
}

impl NextCheck {
    pub fn is_immediate(&self) -> bool {
        self.requeue_after.is_zero()
    }
}

pub fn next_check(expiration: SystemTime, before: Duration, now: SystemTime) -> NextCheck {
    let since_epoch = expiration
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let at = SystemTime::UNIX_EPOCH + since_epoch.saturating_sub(before);
    let requeue_after = at.duration_since(now).unwrap_or(Duration::ZERO);
    NextCheck { at, requeue_after }
}

/// Result of a successful evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The policy should be evaluated again after [`NextCheck::requeue_after`].
    Scheduled {
        next: NextCheck,
        /// Whether this evaluation issued a new credential.
        renewed: bool,
        /// The expiration the schedule was computed from.
        expiration: SystemTime,
    },
    /// The object went away; nothing to schedule.
    Gone { kind: Kind, key: ObjectKey },
}

impl Outcome {
    /// The requeue delay, or `None` when nothing should be scheduled.
    pub const fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Scheduled { next, .. } => Some(next.requeue_after),
            Self::Gone { .. } => None,
        }
    }

    pub const fn renewed(&self) -> bool {
        matches!(self, Self::Scheduled { renewed: true, .. })
    }
}
