// Copyright 2021 Joyent, Inc.

use crate::error::Error;

/// Per-operation retry state machine.
///
/// A fresh policy instance is obtained from a [`RetryPolicyFactory`] for
/// every top-level call, so implementations are free to carry mutable state
/// without synchronization.
pub trait RetryPolicy: Send {
    /// Begin a new top-level operation.
    fn begin(&mut self);

    /// The operation completed successfully.
    fn success(&mut self);

    /// An attempt failed with the given error.
    fn failure(&mut self, error: &Error);

    /// Whether another attempt is permitted.
    fn allow_retry(&self) -> bool;

    /// The number of failed attempts recorded so far.
    fn attempt_count(&self) -> usize;
}

/// Hands out a fresh [`RetryPolicy`] for each top-level operation.
pub trait RetryPolicyFactory: Send + Sync {
    fn retry_policy(&self) -> Box<dyn RetryPolicy>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PolicyState {
    Fresh,
    Attempting,
    Succeeded,
    Exhausted,
}

/// A policy that admits a single attempt and never retries. This is the
/// default policy for the pool.
#[derive(Debug)]
pub struct RunOnce {
    attempts: usize,
    state: PolicyState,
}

impl RunOnce {
    pub fn new() -> Self {
        RunOnce {
            attempts: 0,
            state: PolicyState::Fresh,
        }
    }
}

impl Default for RunOnce {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy for RunOnce {
    fn begin(&mut self) {
        self.attempts = 0;
        self.state = PolicyState::Attempting;
    }

    fn success(&mut self) {
        self.state = PolicyState::Succeeded;
    }

    fn failure(&mut self, _error: &Error) {
        if self.attempts < 1 {
            self.attempts += 1;
        }
        self.state = PolicyState::Exhausted;
    }

    fn allow_retry(&self) -> bool {
        false
    }

    fn attempt_count(&self) -> usize {
        self.attempts
    }
}

/// Factory for [`RunOnce`] policies.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunOnceFactory;

impl RetryPolicyFactory for RunOnceFactory {
    fn retry_policy(&self) -> Box<dyn RetryPolicy> {
        Box::new(RunOnce::new())
    }
}

/// A policy that admits up to `limit` total attempts. The attempt count is
/// capped at the limit, so inspecting a used-up policy reports exactly how
/// much of the budget was spent.
#[derive(Debug)]
pub struct RetryNTimes {
    limit: usize,
    attempts: usize,
    state: PolicyState,
}

impl RetryNTimes {
    pub fn new(limit: usize) -> Self {
        RetryNTimes {
            limit,
            attempts: 0,
            state: PolicyState::Fresh,
        }
    }
}

impl RetryPolicy for RetryNTimes {
    fn begin(&mut self) {
        self.attempts = 0;
        self.state = PolicyState::Attempting;
    }

    fn success(&mut self) {
        self.state = PolicyState::Succeeded;
    }

    fn failure(&mut self, _error: &Error) {
        if self.attempts < self.limit {
            self.attempts += 1;
        }
        if self.attempts >= self.limit {
            self.state = PolicyState::Exhausted;
        }
    }

    fn allow_retry(&self) -> bool {
        self.state == PolicyState::Attempting && self.attempts < self.limit
    }

    fn attempt_count(&self) -> usize {
        self.attempts
    }
}

/// Factory for [`RetryNTimes`] policies.
#[derive(Clone, Copy, Debug)]
pub struct RetryNTimesFactory {
    limit: usize,
}

impl RetryNTimesFactory {
    pub fn new(limit: usize) -> Self {
        RetryNTimesFactory { limit }
    }
}

impl RetryPolicyFactory for RetryNTimesFactory {
    fn retry_policy(&self) -> Box<dyn RetryPolicy> {
        Box::new(RetryNTimes::new(self.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err() -> Error {
        Error::Operation(String::from("boom"))
    }

    #[test]
    fn run_once_never_retries() {
        let mut policy = RunOnce::new();
        policy.begin();
        assert!(!policy.allow_retry());
        policy.failure(&err());
        assert!(!policy.allow_retry());
        assert_eq!(policy.attempt_count(), 1);
    }

    #[test]
    fn retry_n_times_budget() {
        let mut policy = RetryNTimes::new(3);
        policy.begin();
        assert_eq!(policy.attempt_count(), 0);

        policy.failure(&err());
        assert!(policy.allow_retry());
        policy.failure(&err());
        assert!(policy.allow_retry());
        policy.failure(&err());
        assert!(!policy.allow_retry());
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn retry_n_times_attempt_count_is_capped() {
        let mut policy = RetryNTimes::new(2);
        policy.begin();
        for _ in 0..5 {
            policy.failure(&err());
        }
        assert_eq!(policy.attempt_count(), 2);
        assert!(!policy.allow_retry());
    }

    #[test]
    fn retry_n_times_success_finalizes() {
        let mut policy = RetryNTimes::new(3);
        policy.begin();
        policy.failure(&err());
        policy.success();
        assert!(!policy.allow_retry());
        assert_eq!(policy.attempt_count(), 1);
    }

    #[test]
    fn fresh_policy_does_not_allow_retry() {
        let policy = RetryNTimes::new(3);
        assert!(!policy.allow_retry());
    }
}
