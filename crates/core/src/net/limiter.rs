use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub window: Duration,
    pub max_queries: u32,
    pub max_entries: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            max_queries: 3,
            max_entries: 512,
        }
    }
}

#[derive(Debug)]
struct AddressWindow {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

/// Per-source-IP sliding window guarding the connectionless query path.
/// Never errors; when the table is full the oldest entry is evicted.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    entries: HashMap<IpAddr, AddressWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Returns false once the address exceeds the configured query rate
    /// within the current window.
    pub fn check(&mut self, addr: SocketAddr) -> bool {
        let now = Instant::now();
        let ip = addr.ip();

        if let Some(entry) = self.entries.get_mut(&ip) {
            entry.last_seen = now;
            if now.duration_since(entry.window_start) > self.config.window {
                entry.window_start = now;
                entry.count = 1;
                return true;
            }
            entry.count += 1;
            if entry.count > self.config.max_queries {
                log::debug!("rate limited queries from {}", ip);
                return false;
            }
            return true;
        }

        self.evict_stale(now);
        if self.entries.len() >= self.config.max_entries {
            self.evict_oldest();
        }

        self.entries.insert(
            ip,
            AddressWindow {
                count: 1,
                window_start: now,
                last_seen: now,
            },
        );
        true
    }

    pub fn tracked_addresses(&self) -> usize {
        self.entries.len()
    }

    fn evict_stale(&mut self, now: Instant) {
        let window = self.config.window;
        self.entries
            .retain(|_, e| now.duration_since(e.last_seen) <= window * 2);
    }

    fn evict_oldest(&mut self) {
        if let Some(ip) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(ip, _)| *ip)
        {
            self.entries.remove(&ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(octet: u8) -> SocketAddr {
        format!("10.0.0.{}:27025", octet).parse().unwrap()
    }

    #[test]
    fn test_allows_up_to_limit() {
        let mut limiter = RateLimiter::new(RateLimiterConfig {
            window: Duration::from_secs(60),
            max_queries: 3,
            max_entries: 512,
        });

        assert!(limiter.check(addr(1)));
        assert!(limiter.check(addr(1)));
        assert!(limiter.check(addr(1)));
        assert!(!limiter.check(addr(1)));
        assert!(!limiter.check(addr(1)));
    }

    #[test]
    fn test_addresses_independent() {
        let mut limiter = RateLimiter::new(RateLimiterConfig {
            window: Duration::from_secs(60),
            max_queries: 1,
            max_entries: 512,
        });

        assert!(limiter.check(addr(1)));
        assert!(!limiter.check(addr(1)));
        assert!(limiter.check(addr(2)));
    }

    #[test]
    fn test_window_resets() {
        let mut limiter = RateLimiter::new(RateLimiterConfig {
            window: Duration::from_millis(10),
            max_queries: 1,
            max_entries: 512,
        });

        assert!(limiter.check(addr(1)));
        assert!(!limiter.check(addr(1)));
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.check(addr(1)));
    }

    #[test]
    fn test_table_stays_bounded() {
        let mut limiter = RateLimiter::new(RateLimiterConfig {
            window: Duration::from_secs(60),
            max_queries: 3,
            max_entries: 8,
        });

        for i in 0..100 {
            limiter.check(addr(i));
        }
        assert!(limiter.tracked_addresses() <= 8);
    }
}
