use std::time::Duration;

/// How successive retry delays grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// `base * 2^attempt`
    Exponential,
    /// `base * (attempt + 1)`
    Linear,
}

/// Bounded retry schedule shared by the signaling supervisor, the peer
/// reconnect loop and the per-target call retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub growth: Growth,
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub const fn exponential(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            growth: Growth::Exponential,
            base,
            max_delay,
            max_attempts,
        }
    }

    pub const fn linear(step: Duration, max_attempts: u32) -> Self {
        Self {
            growth: Growth::Linear,
            base: step,
            max_delay: Duration::MAX,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (zero based), or `None` once the
    /// ceiling is reached.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let raw = match self.growth {
            Growth::Exponential => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.base.saturating_mul(factor)
            }
            Growth::Linear => self.base.saturating_mul(attempt.saturating_add(1)),
        };
        Some(raw.min(self.max_delay))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).filter_map(move |attempt| self.delay_for(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_never_decrease_and_respect_cap() {
        let policy =
            BackoffPolicy::exponential(Duration::from_millis(250), Duration::from_secs(5), 8);
        let delays: Vec<_> = policy.schedule().collect();
        assert_eq!(delays.len(), 8);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(delays[0], Duration::from_millis(250));
        assert_eq!(delays[2], Duration::from_secs(1));
        assert!(delays.iter().all(|delay| *delay <= Duration::from_secs(5)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn stops_after_ceiling() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30), 3);
        assert!(policy.delay_for(2).is_some());
        assert_eq!(policy.delay_for(3), None);
        assert!(policy.is_exhausted(3));
        assert_eq!(policy.delay_for(u32::MAX), None);
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy =
            BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60), u32::MAX);
        assert_eq!(policy.delay_for(40), Some(Duration::from_secs(60)));
    }

    #[test]
    fn linear_schedule_for_unavailable_peers() {
        let policy = BackoffPolicy::linear(Duration::from_secs(2), 3);
        let delays: Vec<_> = policy.schedule().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 6]);
    }
}
