//! Duplicate guard: reject identical repeat submissions inside a cooldown.
//!
//! Retry-happy mobile clients occasionally fire the same request twice; the
//! guard keeps the second copy from reaching the agent. Only an *identical*
//! transcript inside the window is rejected.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use hark_types::RelayError;

/// Default cooldown window.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

pub struct DuplicateGuard {
    cooldown: Duration,
    last: Mutex<Option<(String, Instant)>>,
}

impl DuplicateGuard {
    pub fn new(cooldown: Duration) -> Self {
        DuplicateGuard {
            cooldown,
            last: Mutex::new(None),
        }
    }

    /// Reject a transcript identical to the last accepted one inside the
    /// cooldown window. Does not record anything.
    pub fn check(&self, transcript: &str) -> Result<(), RelayError> {
        let last = self.last.lock().expect("guard lock poisoned");
        if let Some((prev, at)) = last.as_ref() {
            let elapsed = at.elapsed();
            if elapsed < self.cooldown && prev == transcript {
                let remaining = self.cooldown - elapsed;
                tracing::info!(
                    remaining_ms = remaining.as_millis() as u64,
                    "rejecting duplicate submission inside cooldown"
                );
                return Err(RelayError::Cooldown {
                    remaining_ms: remaining.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Record an accepted transcript as the new cooldown anchor.
    pub fn record(&self, transcript: &str) {
        let mut last = self.last.lock().expect("guard lock poisoned");
        *last = Some((transcript.to_string(), Instant::now()));
    }

    /// [`check`](Self::check) then [`record`](Self::record) in one step.
    pub fn check_and_record(&self, transcript: &str) -> Result<(), RelayError> {
        self.check(transcript)?;
        self.record(transcript);
        Ok(())
    }
}

impl Default for DuplicateGuard {
    fn default() -> Self {
        DuplicateGuard::new(DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_submission_inside_window_is_rejected() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));
        guard.check_and_record("deploy it").unwrap();
        match guard.check_and_record("deploy it") {
            Err(RelayError::Cooldown { remaining_ms }) => assert!(remaining_ms > 0),
            other => panic!("expected Cooldown, got {other:?}"),
        }
    }

    #[test]
    fn different_submission_inside_window_is_accepted() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));
        guard.check_and_record("deploy it").unwrap();
        guard.check_and_record("no wait, roll back").unwrap();
    }

    #[test]
    fn identical_submission_after_window_is_accepted() {
        let guard = DuplicateGuard::new(Duration::from_millis(10));
        guard.check_and_record("deploy it").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        guard.check_and_record("deploy it").unwrap();
    }

    #[test]
    fn check_without_record_leaves_no_anchor() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));
        guard.check("y").unwrap();
        // Nothing was recorded, so the same text is still accepted.
        guard.check_and_record("y").unwrap();
    }

    #[test]
    fn rejection_does_not_extend_the_window() {
        let guard = DuplicateGuard::new(Duration::from_millis(50));
        guard.check_and_record("x").unwrap();
        assert!(guard.check_and_record("x").is_err());
        std::thread::sleep(Duration::from_millis(60));
        // The window is measured from the accepted submission.
        guard.check_and_record("x").unwrap();
    }
}
