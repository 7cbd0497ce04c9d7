//! Fixed-window per-IP rate limiting.
//!
//! Each client gets a counter for a 60 second window. Once the counter reaches
//! `requests_per_minute + burst_limit` the client is blocked for 60 seconds.
//! A window older than 60 seconds is reset before anything else is checked, so
//! a client can send up to twice its quota across a window boundary.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Length of one counting window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// How long a client stays blocked after exceeding its quota.
pub const BLOCK_DURATION: Duration = Duration::from_secs(60);

/// Entries whose window started longer ago than this are swept.
pub const IDLE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_limit: u32,
    /// Sweep cadence of the background cleanup task.
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            burst_limit: 20,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    #[inline]
    #[must_use]
    pub const fn quota(&self) -> u64 {
        self.requests_per_minute as u64 + self.burst_limit as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct RateLimitState {
    count: u64,
    window_start: Instant,
    blocked: bool,
    blocked_until: Instant,
}

impl RateLimitState {
    const fn new(now: Instant) -> Self {
        Self {
            count: 1,
            window_start: now,
            blocked: false,
            blocked_until: now,
        }
    }
}

/// Per-IP request counters behind a single lock.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<IpAddr, RateLimitState>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request from `ip` and decide whether it may proceed.
    pub fn check(&self, ip: IpAddr) -> RateDecision {
        let now = Instant::now();
        let quota = self.config.quota();
        let mut clients = self.clients.lock();

        let Some(state) = clients.get_mut(&ip) else {
            clients.insert(ip, RateLimitState::new(now));
            return RateDecision::Allowed;
        };

        if now.duration_since(state.window_start) > RATE_WINDOW {
            *state = RateLimitState::new(now);
            return RateDecision::Allowed;
        }

        if state.blocked && now < state.blocked_until {
            return RateDecision::Limited {
                retry_after: state.blocked_until - now,
            };
        }

        if state.count >= quota {
            state.blocked = true;
            state.blocked_until = now + BLOCK_DURATION;
            return RateDecision::Limited {
                retry_after: BLOCK_DURATION,
            };
        }

        state.count += 1;
        RateDecision::Allowed
    }

    /// Drop clients whose window started more than [`IDLE_TTL`] ago.
    ///
    /// Returns the number of removed entries.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, state| now.duration_since(state.window_start) <= IDLE_TTL);
        before - clients.len()
    }

    /// Number of tracked clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::time::advance;

    use super::*;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));

    fn limiter(rpm: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: rpm,
            burst_limit: burst,
            ..RateLimitConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_request_rejected_with_quota_of_five() {
        let limiter = limiter(5, 0);
        for i in 0..5 {
            assert_eq!(limiter.check(CLIENT), RateDecision::Allowed, "request {i}");
        }
        assert_eq!(
            limiter.check(CLIENT),
            RateDecision::Limited {
                retry_after: BLOCK_DURATION
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn burst_extends_quota() {
        let limiter = limiter(2, 3);
        for _ in 0..5 {
            assert_eq!(limiter.check(CLIENT), RateDecision::Allowed);
        }
        assert!(matches!(limiter.check(CLIENT), RateDecision::Limited { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_client_reports_remaining_block() {
        let limiter = limiter(1, 0);
        limiter.check(CLIENT);
        limiter.check(CLIENT);

        advance(Duration::from_secs(20)).await;
        assert_eq!(
            limiter.check(CLIENT),
            RateDecision::Limited {
                retry_after: Duration::from_secs(40)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_window_resets_counter_and_block() {
        let limiter = limiter(5, 0);
        for _ in 0..6 {
            limiter.check(CLIENT);
        }

        advance(RATE_WINDOW + Duration::from_secs(1)).await;
        assert_eq!(limiter.check(CLIENT), RateDecision::Allowed);
        for _ in 0..4 {
            assert_eq!(limiter.check(CLIENT), RateDecision::Allowed);
        }
        assert!(matches!(limiter.check(CLIENT), RateDecision::Limited { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_counted_independently() {
        let limiter = limiter(1, 0);
        let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        assert_eq!(limiter.check(CLIENT), RateDecision::Allowed);
        assert!(matches!(limiter.check(CLIENT), RateDecision::Limited { .. }));
        assert_eq!(limiter.check(other), RateDecision::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_idle_entries() {
        let limiter = limiter(5, 0);
        limiter.check(CLIENT);

        advance(Duration::from_secs(200)).await;
        let fresh = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2));
        limiter.check(fresh);

        advance(Duration::from_secs(101)).await;
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.check(fresh), RateDecision::Allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_exceed_quota() {
        let limiter = std::sync::Arc::new(limiter(80, 20));
        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let limiter = std::sync::Arc::clone(&limiter);
            workers.spawn(async move {
                let mut admitted = 0_u64;
                for _ in 0..40 {
                    if limiter.check(CLIENT) == RateDecision::Allowed {
                        admitted += 1;
                    }
                    tokio::task::yield_now().await;
                }
                admitted
            });
        }

        let mut admitted = 0;
        while let Some(result) = workers.join_next().await {
            admitted += result.unwrap();
        }

        assert_eq!(admitted, limiter.config().quota());
        assert_eq!(limiter.len(), 1);
    }
}
