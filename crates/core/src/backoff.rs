use std::time::Duration;

/// Delay schedule shared by the worker loop and the client queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub abort_threshold: u32,
}

impl BackoffPolicy {
    pub const DEFAULT_ABORT_THRESHOLD: u32 = 5;

    /// Server-resident worker: 4 s base, 60 s cap.
    pub const fn server() -> Self {
        Self {
            base: Duration::from_millis(4_000),
            cap: Duration::from_millis(60_000),
            abort_threshold: Self::DEFAULT_ABORT_THRESHOLD,
        }
    }

    /// Client-driven queue: 5 s base, 32 s cap.
    pub const fn client() -> Self {
        Self {
            base: Duration::from_millis(5_000),
            cap: Duration::from_millis(32_000),
            abort_threshold: Self::DEFAULT_ABORT_THRESHOLD,
        }
    }

    /// `min(base * 2^streak, cap)`.
    pub fn delay_for(&self, streak: u32) -> Duration {
        let factor = 1u32.checked_shl(streak).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct BackoffController {
    policy: BackoffPolicy,
    streak: u32,
}

impl BackoffController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, streak: 0 }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn current_delay(&self) -> Duration {
        self.policy.delay_for(self.streak)
    }

    pub fn record_success(&mut self) {
        self.streak = 0;
    }

    pub fn record_failure(&mut self) -> u32 {
        self.streak = self.streak.saturating_add(1);
        self.streak
    }

    /// True once the consecutive-failure streak reaches the abort threshold.
    pub fn should_abort(&self) -> bool {
        self.streak >= self.policy.abort_threshold
    }

    pub fn reset(&mut self) {
        self.streak = 0;
    }
}
