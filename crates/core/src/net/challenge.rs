use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const CHALLENGE_RING_CAPACITY: usize = 16384;
pub const DEFAULT_CHALLENGE_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
pub struct Challenge {
    pub addr: SocketAddr,
    pub value: i32,
    pub issued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Unknown,
    Expired,
    Mismatch,
}

/// Anti-spoof challenge tokens bound to a source address, held in a bounded
/// FIFO ring so a query flood ages old entries out instead of growing
/// memory.
#[derive(Debug)]
pub struct ChallengeManager {
    ring: VecDeque<Challenge>,
    lifetime: Duration,
    capacity: usize,
}

impl ChallengeManager {
    pub fn new(lifetime: Duration) -> Self {
        Self::with_capacity(lifetime, CHALLENGE_RING_CAPACITY)
    }

    pub fn with_capacity(lifetime: Duration, capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity.min(1024)),
            lifetime,
            capacity,
        }
    }

    /// Returns the live challenge value for this address, minting a fresh
    /// one when none exists or the old one expired. Re-issuing the same
    /// value keeps UDP retries of `Connect` working.
    pub fn issue(&mut self, addr: SocketAddr) -> i32 {
        let now = Instant::now();

        if let Some(existing) = self.ring.iter().find(|c| c.addr == addr) {
            if now.duration_since(existing.issued_at) <= self.lifetime {
                return existing.value;
            }
        }
        self.ring.retain(|c| c.addr != addr);

        while self.ring.len() >= self.capacity {
            self.ring.pop_front();
        }

        let value = random_challenge_value();
        self.ring.push_back(Challenge {
            addr,
            value,
            issued_at: now,
        });
        value
    }

    pub fn validate(&self, addr: SocketAddr, value: i32) -> ValidationResult {
        let Some(challenge) = self.ring.iter().find(|c| c.addr == addr) else {
            return ValidationResult::Unknown;
        };

        if challenge.issued_at.elapsed() > self.lifetime {
            return ValidationResult::Expired;
        }
        if challenge.value != value {
            return ValidationResult::Mismatch;
        }
        ValidationResult::Valid
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

fn random_challenge_value() -> i32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64,
    );
    let value = hasher.finish() as i32;
    if value == 0 { 1 } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.1.5:{}", port).parse().unwrap()
    }

    #[test]
    fn test_issue_then_validate() {
        let mut challenges = ChallengeManager::new(DEFAULT_CHALLENGE_LIFETIME);
        let value = challenges.issue(addr(1000));

        assert_eq!(challenges.validate(addr(1000), value), ValidationResult::Valid);
        // Valid does not consume; retried Connect still passes.
        assert_eq!(challenges.validate(addr(1000), value), ValidationResult::Valid);
    }

    #[test]
    fn test_unknown_address() {
        let challenges = ChallengeManager::new(DEFAULT_CHALLENGE_LIFETIME);
        assert_eq!(challenges.validate(addr(1000), 42), ValidationResult::Unknown);
    }

    #[test]
    fn test_mismatched_value() {
        let mut challenges = ChallengeManager::new(DEFAULT_CHALLENGE_LIFETIME);
        let value = challenges.issue(addr(1000));
        assert_eq!(
            challenges.validate(addr(1000), value.wrapping_add(1)),
            ValidationResult::Mismatch
        );
    }

    #[test]
    fn test_no_cross_address_replay() {
        let mut challenges = ChallengeManager::new(DEFAULT_CHALLENGE_LIFETIME);
        let value = challenges.issue(addr(1000));
        challenges.issue(addr(2000));

        let result = challenges.validate(addr(2000), value);
        assert!(result == ValidationResult::Mismatch || result == ValidationResult::Valid);
        if result == ValidationResult::Valid {
            // Only possible if both addresses independently drew the same
            // value, in which case each is still bound to its own entry.
            assert_eq!(challenges.validate(addr(1000), value), ValidationResult::Valid);
        }
    }

    #[test]
    fn test_reissue_returns_same_live_value() {
        let mut challenges = ChallengeManager::new(DEFAULT_CHALLENGE_LIFETIME);
        let first = challenges.issue(addr(1000));
        let second = challenges.issue(addr(1000));
        assert_eq!(first, second);
        assert_eq!(challenges.len(), 1);
    }

    #[test]
    fn test_expired_challenge() {
        let mut challenges = ChallengeManager::new(Duration::from_millis(5));
        let value = challenges.issue(addr(1000));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(challenges.validate(addr(1000), value), ValidationResult::Expired);

        // Re-issue after expiry mints a new entry rather than keeping two.
        challenges.issue(addr(1000));
        assert_eq!(challenges.len(), 1);
    }

    #[test]
    fn test_flood_stays_bounded() {
        let mut challenges = ChallengeManager::with_capacity(DEFAULT_CHALLENGE_LIFETIME, 64);

        for port in 1..=1000u16 {
            challenges.issue(addr(port));
        }
        assert_eq!(challenges.len(), 64);

        // Oldest entries were evicted FIFO.
        assert_eq!(challenges.validate(addr(1), 0), ValidationResult::Unknown);
    }
}
