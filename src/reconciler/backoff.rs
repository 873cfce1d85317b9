use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Per-object exponential retry delay for failed reconciles.
#[derive(Debug)]
pub(crate) struct ErrorBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ErrorBackoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure and returns how long to wait before the next attempt.
    pub(crate) fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = (*count).min(31);
        *count = count.saturating_add(1);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub(crate) fn reset(&self, key: &str) {
        self.failures.lock().remove(key);
    }
}
