use crate::protocol::messages::RetryPolicyOverride;
use std::time::Duration;

/// Budget and pacing for re-running a failed side-effect closure.
///
/// The loop pauses `initial_delay` after the first failure and multiplies the
/// pause by `backoff_factor` after every further one, clamped to `max_delay`.
/// It gives up once `max_attempts` executions happened or `max_elapsed`
/// wall-clock time was burned; bounds left unset never trigger.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Pause before the second attempt.
    pub initial_delay: Duration,
    /// Growth applied to the pause after each failed attempt.
    pub backoff_factor: f32,
    /// Ceiling on a single pause.
    pub max_delay: Option<Duration>,
    /// Total executions allowed, the first one included.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget for the whole loop.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    /// Keep retrying forever, backing off from 50ms up to 10s.
    pub fn unbounded() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            max_delay: Some(Duration::from_secs(10)),
            max_attempts: None,
            max_elapsed: None,
        }
    }

    /// The first failure is final.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::unbounded()
        }
    }

    /// Constant pacing between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            backoff_factor: 1.0,
            max_delay: None,
            max_attempts: None,
            max_elapsed: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }
}

impl From<RetryPolicyOverride> for RetryPolicy {
    fn from(value: RetryPolicyOverride) -> Self {
        let base = RetryPolicy::unbounded();
        RetryPolicy {
            initial_delay: value
                .initial_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(base.initial_delay),
            backoff_factor: value.factor.unwrap_or(base.backoff_factor),
            max_delay: value.max_interval_ms.map(Duration::from_millis).or(base.max_delay),
            max_attempts: value.max_attempts,
            max_elapsed: value.max_duration_ms.map(Duration::from_millis),
        }
    }
}

/// One in-flight retry loop: counts failures and carries the current pause.
#[derive(Debug)]
pub(crate) struct RetryLoop {
    policy: RetryPolicy,
    next_delay: Duration,
    failed_attempts: u32,
}

impl RetryLoop {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        let next_delay = policy.initial_delay;
        Self {
            policy,
            next_delay,
            failed_attempts: 0,
        }
    }

    /// Register a failed attempt. Returns the pause to take before the next
    /// one, or `None` once the attempt or time budget is spent.
    pub(crate) fn next_pause(&mut self, elapsed: Duration) -> Option<Duration> {
        self.failed_attempts += 1;
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.failed_attempts >= max)
        {
            return None;
        }
        if self.policy.max_elapsed.is_some_and(|max| elapsed >= max) {
            return None;
        }

        let pause = self.next_delay;
        let grown = self.next_delay.mul_f32(self.policy.backoff_factor);
        self.next_delay = match self.policy.max_delay {
            Some(cap) => grown.min(cap),
            None => grown,
        };
        Some(pause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn pause_grows_until_the_cap() {
        let mut retry = RetryLoop::new(RetryPolicy {
            initial_delay: 10 * MS,
            backoff_factor: 3.0,
            max_delay: Some(50 * MS),
            max_attempts: None,
            max_elapsed: None,
        });

        assert_eq!(retry.next_pause(Duration::ZERO), Some(10 * MS));
        assert_eq!(retry.next_pause(Duration::ZERO), Some(30 * MS));
        // 90ms clamps to the cap and stays there.
        assert_eq!(retry.next_pause(Duration::ZERO), Some(50 * MS));
        assert_eq!(retry.next_pause(Duration::ZERO), Some(50 * MS));
    }

    #[test]
    fn attempt_budget_counts_the_first_execution() {
        let mut retry = RetryLoop::new(RetryPolicy::fixed(5 * MS).with_max_attempts(3));

        assert_eq!(retry.next_pause(Duration::ZERO), Some(5 * MS));
        assert_eq!(retry.next_pause(Duration::ZERO), Some(5 * MS));
        // The third execution already happened; nothing is left to spend.
        assert_eq!(retry.next_pause(Duration::ZERO), None);
    }

    #[test]
    fn no_retries_gives_up_on_the_first_failure() {
        let mut retry = RetryLoop::new(RetryPolicy::no_retries());
        assert_eq!(retry.next_pause(Duration::ZERO), None);
    }

    #[test]
    fn elapsed_budget_wins_over_attempts() {
        let mut retry = RetryLoop::new(RetryPolicy::fixed(MS).with_max_elapsed(100 * MS));

        assert_eq!(retry.next_pause(99 * MS), Some(MS));
        assert_eq!(retry.next_pause(100 * MS), None);
    }

    #[test]
    fn override_fills_unset_fields_from_the_unbounded_policy() {
        let policy: RetryPolicy = RetryPolicyOverride {
            max_attempts: Some(4),
            factor: Some(1.5),
            ..Default::default()
        }
        .into();

        assert_eq!(policy.max_attempts, Some(4));
        assert_eq!(policy.backoff_factor, 1.5);
        assert_eq!(policy.initial_delay, RetryPolicy::unbounded().initial_delay);
        assert_eq!(policy.max_delay, RetryPolicy::unbounded().max_delay);
        assert_eq!(policy.max_elapsed, None);
    }
}
