//! Failure counting and restart bookkeeping for one test.

use std::collections::HashMap;

use crate::test_case::{RuntimeId, TestCase};

/// Tracks sub-test failures of one test and the sub-tests queued for
/// restart.
///
/// The failure count is per test, not per sub-test: the test fails once the
/// total reaches the configured maximum, whichever sub-tests failed.
#[derive(Debug, Default)]
pub struct RestartQueue {
    failures: usize,
    attempts: HashMap<RuntimeId, usize>,
    queued: Vec<TestCase>,
}

impl RestartQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure of `runtime_id` and returns the test's total.
    pub fn record_failure(&mut self, runtime_id: &RuntimeId) -> usize {
        self.failures += 1;
        *self.attempts.entry(runtime_id.clone()).or_default() += 1;
        self.failures
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Failures recorded for one sub-test.
    pub fn failures_of(&self, runtime_id: &RuntimeId) -> usize {
        self.attempts.get(runtime_id).copied().unwrap_or(0)
    }

    /// Whether `failures` has reached `max_retries`.
    pub fn exhausted(&self, max_retries: usize) -> bool {
        self.failures >= max_retries
    }

    /// Queues a sub-test for restart. Returns `false` if it already is.
    pub fn queue(&mut self, test: TestCase) -> bool {
        let runtime_id = test.runtime_id();
        if self.queued.iter().any(|t| t.runtime_id() == runtime_id) {
            return false;
        }
        self.queued.push(test);
        true
    }

    /// Removes a sub-test whose restart was allocated.
    pub fn take(&mut self, runtime_id: &RuntimeId) -> Option<TestCase> {
        let index = self
            .queued
            .iter()
            .position(|t| &t.runtime_id() == runtime_id)?;
        Some(self.queued.remove(index))
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn queued_ids(&self) -> Vec<String> {
        self.queued
            .iter()
            .map(|t| t.runtime_id().to_string())
            .collect()
    }
}
