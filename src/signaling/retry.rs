//! Exponential backoff used for message delivery and relay reconnects.
use crate::common::ms_to_micros;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// delay after the first failure (usec)
    pub base_delay: u128,
    /// delays never grow past this (usec)
    pub max_delay: u128,
    /// attempts before the message is given up on
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay: ms_to_micros(500),
            max_delay: ms_to_micros(8000),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failures` failed attempts (1 based).
    pub fn delay_after(&self, failures: u32) -> u128 {
        if failures == 0 {
            return 0;
        }
        let shift = (failures - 1).min(32);
        self.base_delay
            .saturating_mul(1u128 << shift)
            .min(self.max_delay)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// Tracks failures for one thing being retried (a message, a connection).
#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    next_attempt: u128,
}

impl Backoff {
    pub fn new() -> Backoff {
        Backoff {
            failures: 0,
            next_attempt: 0,
        }
    }
    pub fn ready(&self, now: u128) -> bool {
        now >= self.next_attempt
    }
    pub fn failures(&self) -> u32 {
        self.failures
    }
    /// Record a failure at `now`, returns false once the policy is exhausted
    pub fn fail(&mut self, now: u128, policy: &RetryPolicy) -> bool {
        self.failures += 1;
        self.next_attempt = now + policy.delay_after(self.failures);
        !policy.exhausted(self.failures)
    }
    pub fn succeed(&mut self) {
        self.failures = 0;
        self.next_attempt = 0;
    }
}
