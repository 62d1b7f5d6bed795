// ── Per-protocol throttle map ──
//
// Address → last-processed instant. Each protocol owns its own map and
// lock, so a burst on one protocol never contends with another.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Window applied to every passive protocol.
pub const PASSIVE_THROTTLE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Entries beyond this count trigger a sweep of expired addresses.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug)]
pub struct ThrottleMap {
    window: Duration,
    seen: Mutex<HashMap<IpAddr, Instant>>,
}

impl ThrottleMap {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an offer of `addr`. Returns `true` when the offer should
    /// be processed, `false` when it falls inside the window of the
    /// last processed offer.
    pub fn admit(&self, addr: IpAddr) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        if seen
            .get(&addr)
            .is_some_and(|last| now.duration_since(*last) < self.window)
        {
            return false;
        }
        seen.insert(addr, now);

        if seen.len() > PRUNE_THRESHOLD {
            let window = self.window;
            seen.retain(|_, last| now.duration_since(*last) < window);
        }
        true
    }

    /// Forget every address. Used when a listener restarts.
    pub fn clear(&self) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_inside_window_are_dropped() {
        let map = ThrottleMap::new(PASSIVE_THROTTLE_WINDOW);
        let ip = addr("10.0.0.5");

        let admitted = (0..20).filter(|_| map.admit(ip)).count();
        assert_eq!(admitted, 1);

        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        assert!(!map.admit(ip));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(map.admit(ip));
        assert!(!map.admit(ip));
    }

    #[tokio::test(start_paused = true)]
    async fn addresses_are_independent() {
        let map = ThrottleMap::new(PASSIVE_THROTTLE_WINDOW);
        assert!(map.admit(addr("10.0.0.5")));
        assert!(map.admit(addr("10.0.0.6")));
        assert_eq!(map.len(), 2);

        map.clear();
        assert!(map.is_empty());
        assert!(map.admit(addr("10.0.0.5")));
    }
}
