//! Error throttler (C3).
//!
//! Wraps a user-visible error-reporting sink and collapses repeated or
//! numerous failures into a single "muted" notice, then swallows
//! everything until an `ok()` arrives, at which point it emits exactly
//! one "recovered" notice and resumes normal forwarding.

/// A notice the throttler hands to its sink, distinguishable from a raw
/// forwarded error so formatting can style them differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleNotice {
    /// A raw error forwarded unchanged (neither cap breached yet).
    Forwarded(String),
    /// First breach: same error repeated `MAX_SAME` times.
    MutedSameError(String),
    /// First breach: more than `MAX_DIFF` distinct errors since the last `ok`.
    MutedTooManyErrors,
    /// Emitted once, the first `ok()` after being muted.
    Recovered,
}

/// Tracks same-error streak length and total-error count since the last
/// `ok()`, muting once either cap is exceeded.
pub struct ErrorThrottler {
    max_same: u32,
    max_diff: u32,
    same_streak: u32,
    total_since_ok: u32,
    last_error: Option<String>,
    stopped: bool,
}

impl Default for ErrorThrottler {
    fn default() -> Self {
        Self::new(1, 4)
    }
}

impl ErrorThrottler {
    pub fn new(max_same: u32, max_diff: u32) -> Self {
        Self {
            max_same,
            max_diff,
            same_streak: 0,
            total_since_ok: 0,
            last_error: None,
            stopped: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Feed one `error(msg)` event, returning what (if anything) should be
    /// shown to the user.
    pub fn error(&mut self, msg: impl Into<String>) -> Option<ThrottleNotice> {
        let msg = msg.into();

        if self.stopped {
            // already muted: swallow silently.
            return None;
        }

        if self.last_error.as_deref() == Some(msg.as_str()) {
            self.same_streak += 1;
        } else {
            self.same_streak = 1;
            self.last_error = Some(msg.clone());
        }
        self.total_since_ok += 1;

        if self.same_streak > self.max_same {
            self.stopped = true;
            return Some(ThrottleNotice::MutedSameError(msg));
        }
        if self.total_since_ok > self.max_diff {
            self.stopped = true;
            return Some(ThrottleNotice::MutedTooManyErrors);
        }

        Some(ThrottleNotice::Forwarded(msg))
    }

    /// Feed one `ok()` event, resetting counters. Returns `Recovered` the
    /// first time this follows a muted streak; `None` otherwise.
    pub fn ok(&mut self) -> Option<ThrottleNotice> {
        let was_stopped = self.stopped;
        self.same_streak = 0;
        self.total_since_ok = 0;
        self.last_error = None;
        self.stopped = false;

        if was_stopped {
            Some(ThrottleNotice::Recovered)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_until_same_error_cap_breached() {
        let mut t = ErrorThrottler::new(1, 4);
        assert_eq!(
            t.error("boom"),
            Some(ThrottleNotice::Forwarded("boom".into()))
        );
        // second identical error breaches MAX_SAME=1
        assert_eq!(
            t.error("boom"),
            Some(ThrottleNotice::MutedSameError("boom".into()))
        );
        assert!(t.is_stopped());
        // further errors are swallowed while stopped
        assert_eq!(t.error("boom"), None);
        assert_eq!(t.error("other"), None);
    }

    #[test]
    fn forwards_until_total_error_cap_breached() {
        let mut t = ErrorThrottler::new(10, 4);
        for i in 0..4 {
            assert!(matches!(t.error(format!("e{i}")), Some(ThrottleNotice::Forwarded(_))));
        }
        assert!(!t.is_stopped());
        assert_eq!(t.error("e5"), Some(ThrottleNotice::MutedTooManyErrors));
        assert!(t.is_stopped());
    }

    #[test]
    fn ok_resets_and_emits_recovered_only_once() {
        let mut t = ErrorThrottler::new(1, 4);
        t.error("boom");
        t.error("boom");
        assert!(t.is_stopped());

        assert_eq!(t.ok(), Some(ThrottleNotice::Recovered));
        // ok() while already healthy emits nothing
        assert_eq!(t.ok(), None);

        // normal forwarding resumes post-recovery
        assert_eq!(
            t.error("fresh"),
            Some(ThrottleNotice::Forwarded("fresh".into()))
        );
    }

    #[test]
    fn distinct_errors_below_max_diff_never_mute() {
        let mut t = ErrorThrottler::new(1, 4);
        for i in 0..4 {
            assert!(matches!(
                t.error(format!("distinct-{i}")),
                Some(ThrottleNotice::Forwarded(_))
            ));
        }
        assert!(!t.is_stopped());
    }
}
