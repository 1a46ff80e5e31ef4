//! Per-peer inbound rate limiting using a token bucket

use crate::transport::PeerId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;

/// Rate limiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Frames refilled per second
    pub frames_per_second: u32,
    /// Bucket capacity
    pub burst_size: u32,
}

impl RateLimitConfig {
    pub fn new(frames_per_second: u32, burst_size: u32) -> Self {
        Self {
            frames_per_second,
            burst_size,
        }
    }

    /// Burst defaults to twice the rate
    pub fn from_rate(frames_per_second: u32, burst: Option<u32>) -> Self {
        Self::new(
            frames_per_second,
            burst.unwrap_or(frames_per_second.saturating_mul(2)),
        )
    }
}

struct Bucket {
    /// Available tokens, scaled by 1000
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket for one peer.
///
/// Allows bursting up to `burst_size` frames, then limits to
/// `frames_per_second`, refilled continuously.
pub struct TokenBucket {
    bucket: Mutex<Bucket>,
    /// Scaled tokens per millisecond
    tokens_per_ms: u64,
    max_tokens: u64,
}

const TOKEN: u64 = 1000;

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        let max_tokens = config.burst_size as u64 * TOKEN;
        Self {
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
            // frames/s * 1000 scaled units / 1000 ms
            tokens_per_ms: config.frames_per_second as u64,
            max_tokens,
        }
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed_ms = now.duration_since(bucket.last_refill).as_millis() as u64;
        if elapsed_ms > 0 {
            bucket.tokens = (bucket.tokens + self.tokens_per_ms * elapsed_ms).min(self.max_tokens);
            bucket.last_refill = now;
        }

        if bucket.tokens < TOKEN {
            return false;
        }
        bucket.tokens -= TOKEN;
        true
    }

    pub fn available(&self) -> u32 {
        (self.bucket.lock().tokens / TOKEN) as u32
    }
}

/// One bucket per peer; a disabled limiter admits everything
pub struct PeerRateLimiter {
    config: Option<RateLimitConfig>,
    buckets: DashMap<PeerId, TokenBucket>,
}

impl PeerRateLimiter {
    pub fn new(config: Option<RateLimitConfig>) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Whether the next frame from `peer` is within budget
    pub fn allow(&self, peer: &PeerId) -> bool {
        let config = match self.config {
            Some(config) => config,
            None => return true,
        };
        self.buckets
            .entry(peer.clone())
            .or_insert_with(|| TokenBucket::new(config))
            .try_acquire()
    }

    /// Forget a disconnected peer's bucket
    pub fn remove(&self, peer: &PeerId) {
        self.buckets.remove(peer);
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_burst_then_limit() {
        let bucket = TokenBucket::new(RateLimitConfig::new(10, 5));

        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
        assert_eq!(bucket.available(), 0);
    }

    #[test]
    fn test_refill_over_time() {
        let bucket = TokenBucket::new(RateLimitConfig::new(1000, 10));
        for _ in 0..10 {
            bucket.try_acquire();
        }
        assert!(!bucket.try_acquire());

        // 1000/s = 1 per ms
        thread::sleep(Duration::from_millis(20));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_peers_have_separate_buckets() {
        let limiter = PeerRateLimiter::new(Some(RateLimitConfig::new(1, 2)));
        let noisy = PeerId::from("noisy");
        let quiet = PeerId::from("quiet");

        assert!(limiter.allow(&noisy));
        assert!(limiter.allow(&noisy));
        assert!(!limiter.allow(&noisy));
        assert!(limiter.allow(&quiet));

        limiter.remove(&noisy);
        assert!(limiter.allow(&noisy));
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let limiter = PeerRateLimiter::disabled();
        let peer = PeerId::from("p");
        assert!(!limiter.is_enabled());
        assert!((0..10_000).all(|_| limiter.allow(&peer)));
    }

    #[test]
    fn test_default_burst() {
        assert_eq!(RateLimitConfig::from_rate(50, None).burst_size, 100);
        assert_eq!(RateLimitConfig::from_rate(50, Some(7)).burst_size, 7);
    }
}
