use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tokio::sync::RwLock;

const WINDOW: Duration = Duration::from_secs(1);
const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const TRACKER_IDLE_TTL: Duration = Duration::from_secs(10 * 60);

/// Per-client-IP sliding-window counter. Each tracker has its own short-held
/// mutex so the background reaper never blocks an admission check.
struct RateTracker {
    instants: Mutex<Vec<Instant>>,
}

impl RateTracker {
    fn new() -> Self {
        Self {
            instants: Mutex::new(Vec::new()),
        }
    }

    fn last_seen(&self) -> Option<Instant> {
        self.instants.lock().expect("rate tracker lock poisoned").last().copied()
    }
}

pub struct RateLimitOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
}

/// Per-client sliding-window rate limiter with a background eviction task
/// for idle trackers. The reaper only ever looks up entries in the map; the
/// map itself stays owned by this struct.
pub struct RateLimiter {
    rps: u32,
    burst: u32,
    trackers: RwLock<HashMap<IpAddr, RateTracker>>,
}

impl RateLimiter {
    pub fn new(rps: u32, burst: u32) -> Self {
        Self {
            rps,
            burst,
            trackers: RwLock::new(HashMap::new()),
        }
    }

    /// The advertised `X-RateLimit-Limit`. Equal to the admission cap
    /// (`rps`): the sliding window only ever admits up to `rps` requests per
    /// second (see `admit`), so the header must not promise more than that.
    pub fn limit(&self) -> u32 {
        self.rps
    }

    /// Configured burst allowance. Accepted from `RATE_LIMIT_BURST` for
    /// parity with the documented environment surface; the sliding-window
    /// admission check enforces `rps` alone.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub async fn check(&self, ip: IpAddr) -> RateLimitOutcome {
        // Fast path: tracker already exists.
        {
            let guard = self.trackers.read().await;
            if let Some(tracker) = guard.get(&ip) {
                return self.admit(tracker);
            }
        }
        // Slow path: create lazily under the write lock, re-checking in case
        // another caller raced us to it.
        let mut guard = self.trackers.write().await;
        let tracker = guard.entry(ip).or_insert_with(RateTracker::new);
        self.admit(tracker)
    }

    fn admit(&self, tracker: &RateTracker) -> RateLimitOutcome {
        let now = Instant::now();
        let mut instants = tracker.instants.lock().expect("rate tracker lock poisoned");
        instants.retain(|seen| now.duration_since(*seen) < WINDOW);

        let limit = self.limit();
        if instants.len() as u32 >= self.rps {
            return RateLimitOutcome {
                allowed: false,
                limit,
                remaining: 0,
            };
        }
        instants.push(now);
        RateLimitOutcome {
            allowed: true,
            limit,
            remaining: self.rps.saturating_sub(instants.len() as u32),
        }
    }

    /// Scans all trackers and drops any idle for more than ten minutes.
    /// Intended to run every five minutes on a background task.
    pub async fn reap_idle(&self) {
        let mut guard = self.trackers.write().await;
        let now = Instant::now();
        guard.retain(|_, tracker| {
            tracker
                .last_seen()
                .is_some_and(|last| now.duration_since(last) < TRACKER_IDLE_TTL)
        });
    }

    pub async fn run_reaper(self: std::sync::Arc<Self>) {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            self.reap_idle().await;
        }
    }
}

/// Extracts the client IP using the precedence: `X-Forwarded-For` (first
/// entry), then `X-Real-IP`, then the transport remote address. Malformed
/// headers fall through to the next source without erroring.
pub fn client_ip(headers: &HeaderMap, remote: IpAddr) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
        && let Ok(ip) = first.trim().parse::<IpAddr>()
    {
        return ip;
    }
    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && let Ok(ip) = value.trim().parse::<IpAddr>()
    {
        return ip;
    }
    remote
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, n])
    }

    #[tokio::test]
    async fn admits_up_to_rps_then_rejects() {
        let limiter = RateLimiter::new(2, 4);
        let a = limiter.check(ip(1)).await;
        let b = limiter.check(ip(1)).await;
        let c = limiter.check(ip(1)).await;
        assert!(a.allowed);
        assert!(b.allowed);
        assert!(!c.allowed);
        assert_eq!(c.remaining, 0);
    }

    #[tokio::test]
    async fn limit_and_remaining_track_rps_not_burst() {
        let limiter = RateLimiter::new(10, 20);
        let outcome = limiter.check(ip(1)).await;
        assert!(outcome.allowed);
        assert_eq!(outcome.limit, 10);
        assert_eq!(outcome.remaining, 9);

        for _ in 0..9 {
            assert!(limiter.check(ip(1)).await.allowed);
        }
        let rejected = limiter.check(ip(1)).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.limit, 10);
        assert_eq!(rejected.remaining, 0);
    }

    #[tokio::test]
    async fn separate_ips_have_independent_windows() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.check(ip(1)).await.allowed);
        assert!(limiter.check(ip(2)).await.allowed);
    }

    #[tokio::test]
    async fn window_resets_after_one_second() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.check(ip(1)).await.allowed);
        assert!(!limiter.check(ip(1)).await.allowed);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.check(ip(1)).await.allowed);
    }

    #[test]
    fn x_forwarded_for_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
        let resolved = client_ip(&headers, ip(255));
        assert_eq!(resolved, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn malformed_header_falls_through() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        let resolved = client_ip(&headers, ip(42));
        assert_eq!(resolved, ip(42));
    }
}
