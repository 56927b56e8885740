use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 20,
        }
    }
}

/// Sliding-window request counter keyed by caller identity.
#[derive(Debug, Default)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    hits: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            hits: DashMap::new(),
        }
    }

    pub fn settings(&self) -> RateLimitSettings {
        self.settings
    }

    /// Record a request. `Err` carries how long until the oldest hit leaves
    /// the window.
    pub fn check(&self, identity: &str) -> Result<(), Duration> {
        self.check_at(identity, Instant::now())
    }

    pub fn check_at(&self, identity: &str, now: Instant) -> Result<(), Duration> {
        let window = self.settings.window;
        let mut hits = self.hits.entry(identity.to_string()).or_default();
        while hits
            .front()
            .is_some_and(|&hit| now.saturating_duration_since(hit) >= window)
        {
            hits.pop_front();
        }

        if hits.len() >= self.settings.max_requests {
            let retry_after = hits
                .front()
                .map(|&oldest| window.saturating_sub(now.saturating_duration_since(oldest)))
                .unwrap_or(window);
            return Err(retry_after);
        }

        hits.push_back(now);
        Ok(())
    }

    /// Drop identities with no hits left in the window.
    pub fn prune_at(&self, now: Instant) -> usize {
        let window = self.settings.window;
        let before = self.hits.len();
        self.hits.retain(|_, hits| {
            hits.back()
                .is_some_and(|&hit| now.saturating_duration_since(hit) < window)
        });
        before - self.hits.len()
    }

    pub fn tracked_identities(&self) -> usize {
        self.hits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: usize) -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            window: Duration::from_secs(60),
            max_requests,
        })
    }

    #[test]
    fn allows_up_to_limit_within_window() {
        let limiter = limiter(20);
        let start = Instant::now();
        for i in 0..20 {
            assert!(limiter.check_at("1.2.3.4", start + Duration::from_millis(i)).is_ok());
        }
        let retry_after = limiter
            .check_at("1.2.3.4", start + Duration::from_secs(10))
            .unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(50));

        assert!(limiter.check_at("5.6.7.8", start).is_ok());
    }

    #[test]
    fn window_slides_as_old_hits_expire() {
        let limiter = limiter(2);
        let start = Instant::now();
        assert!(limiter.check_at("ip", start).is_ok());
        assert!(limiter.check_at("ip", start + Duration::from_secs(30)).is_ok());
        assert!(limiter.check_at("ip", start + Duration::from_secs(59)).is_err());
        assert!(limiter.check_at("ip", start + Duration::from_secs(60)).is_ok());
        assert!(limiter.check_at("ip", start + Duration::from_secs(61)).is_err());
    }

    #[test]
    fn prune_forgets_idle_callers() {
        let limiter = limiter(5);
        let start = Instant::now();
        limiter.check_at("old", start).unwrap();
        limiter.check_at("new", start + Duration::from_secs(50)).unwrap();
        assert_eq!(limiter.prune_at(start + Duration::from_secs(70)), 1);
        assert_eq!(limiter.tracked_identities(), 1);
    }
}
