use std::time::{Duration, Instant};

/// Coalesces bursts of mutations into one flush. A flush becomes due once
/// the log has been quiet for `window`, or once `max_wait` has passed since
/// the first unflushed mutation, whichever comes first.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    max_wait: Duration,
    first_pending: Option<Instant>,
    last_mutation: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration, max_wait: Duration) -> Self {
        Self {
            window,
            max_wait: max_wait.max(window),
            first_pending: None,
            last_mutation: None,
        }
    }

    pub fn note(&mut self, now: Instant) {
        self.first_pending.get_or_insert(now);
        self.last_mutation = Some(now);
    }

    pub fn is_idle(&self) -> bool {
        self.first_pending.is_none()
    }

    pub fn due(&self, now: Instant) -> bool {
        match (self.first_pending, self.last_mutation) {
            (Some(first), Some(last)) => {
                now.saturating_duration_since(last) >= self.window
                    || now.saturating_duration_since(first) >= self.max_wait
            }
            _ => false,
        }
    }

    /// Time until the next flush would become due, if anything is pending.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let (first, last) = (self.first_pending?, self.last_mutation?);
        let quiet = self.window.saturating_sub(now.saturating_duration_since(last));
        let capped = self
            .max_wait
            .saturating_sub(now.saturating_duration_since(first));
        Some(quiet.min(capped))
    }

    pub fn reset(&mut self) {
        self.first_pending = None;
        self.last_mutation = None;
    }
}
