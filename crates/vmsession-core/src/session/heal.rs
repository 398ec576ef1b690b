//! Error healing window.

use chrono::{DateTime, Duration, Utc};

/// Counts errors that happen close to each other.
#[derive(Debug, Default)]
pub(crate) struct HealTracker {
    count: u32,
    last: Option<DateTime<Utc>>,
}

impl HealTracker {
    /// Record an error at `now`. Returns `true` once more than `tries`
    /// errors happened with less than `window` between consecutive ones.
    pub fn record(&mut self, now: DateTime<Utc>, window: Duration, tries: u32) -> bool {
        let within = self.last.is_some_and(|last| now - last < window);
        self.count = if within { self.count + 1 } else { 1 };
        self.last = Some(now);
        self.count > tries
    }

    #[cfg(test)]
    pub fn count(&self) -> u32 {
        self.count
    }
}
