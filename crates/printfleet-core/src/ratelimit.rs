// ── Rate-limited warnings ──

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Default spacing between warnings that share a key.
pub const WARN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Allows one warning per key per interval. Callers demote suppressed
/// warnings to `debug!`.
#[derive(Debug)]
pub struct WarnLimiter {
    interval: Duration,
    last: DashMap<String, Instant>,
}

impl WarnLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: DashMap::new(),
        }
    }

    pub fn should_warn(&self, key: &str) -> bool {
        let now = Instant::now();
        if let Some(mut last) = self.last.get_mut(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
            *last = now;
            return true;
        }
        self.last.insert(key.to_owned(), now);
        true
    }
}

impl Default for WarnLimiter {
    fn default() -> Self {
        Self::new(WARN_INTERVAL)
    }
}
