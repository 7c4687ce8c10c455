use std::time::Duration;

const MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max_delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_millis() as u64;
        let mut delay = self.initial.as_millis() as u64;
        for _ in 1..attempt {
            if delay >= cap {
                break;
            }
            delay = (delay as f64 * MULTIPLIER) as u64;
        }
        Duration::from_millis(delay.min(cap))
    }

    /// Claims the next attempt and its delay, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for(self.attempts))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(1000), Duration::from_millis(10_000), 5)
    }

    #[test]
    fn delays_grow_by_half() {
        let mut policy = policy();
        let delays: Vec<u64> = std::iter::from_fn(|| policy.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 1500, 2250, 3375, 5062]);
    }

    #[test]
    fn delay_never_exceeds_cap() {
        let policy = policy();
        assert_eq!(policy.delay_for(6).as_millis(), 7593);
        for attempt in 7..40 {
            assert_eq!(policy.delay_for(attempt).as_millis(), 10_000);
        }
    }

    #[test]
    fn exhausted_until_reset() {
        let mut policy = policy();
        while policy.next_delay().is_some() {}
        assert_eq!(policy.attempts(), 5);
        assert_eq!(policy.next_delay(), None);

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
    }
}
