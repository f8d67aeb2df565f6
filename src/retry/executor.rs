//! Retry loop applying a [`RetryPolicy`] to an arbitrary operation.
//!
//! Operation errors are captured, never propagated: every execution ends in
//! a [`RetryResult`] whose `outcome` says how it ended.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};

use super::policy::{RetryOutcome, RetryPolicy};
use crate::observability::get_metrics;

/// Result of a retried execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryResult<T> {
    pub outcome: RetryOutcome,
    /// Calls made to the operation, never more than `max_attempts`.
    pub attempts: u32,
    pub total_delay_ms: u64,
    pub last_error: Option<String>,
    pub success: bool,
    /// Value returned by the successful call.
    pub value: Option<T>,
    /// `elapsed_ms`, plus `reason` on abort and `context` when supplied.
    pub metadata: Map<String, Value>,
}

impl<T> RetryResult<T> {
    pub fn elapsed_ms(&self) -> Option<u64> {
        self.metadata.get("elapsed_ms").and_then(Value::as_u64)
    }

    /// Converts into a plain `Result`, using the last error (or the outcome) on failure.
    pub fn into_result(self) -> std::result::Result<T, String> {
        match self.value {
            Some(value) if self.success => Ok(value),
            _ => Err(self
                .last_error
                .unwrap_or_else(|| format!("retry {}", self.outcome.as_str()))),
        }
    }
}

enum Step {
    Wait(u64),
    Stop(RetryOutcome),
}

/// Bookkeeping shared by the blocking and async loops.
struct RetryLoop<'a> {
    policy: &'a RetryPolicy,
    risk_score: f64,
    context: Option<Value>,
    started: Instant,
    attempts: u32,
    total_delay_ms: u64,
    last_error: Option<String>,
}

impl<'a> RetryLoop<'a> {
    fn new(policy: &'a RetryPolicy, risk_score: f64, context: Option<Value>) -> Self {
        Self {
            policy,
            risk_score,
            context,
            started: Instant::now(),
            attempts: 0,
            total_delay_ms: 0,
            last_error: None,
        }
    }

    fn has_attempts_left(&self) -> bool {
        self.attempts < self.policy.config().max_attempts
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn strategy(&self) -> &'static str {
        self.policy.config().strategy.as_str()
    }

    fn on_failure(&mut self, error: String) -> Step {
        let max_attempts = self.policy.config().max_attempts;
        self.attempts += 1;
        get_metrics().record_retry_attempt(self.strategy(), false);
        tracing::warn!("Attempt {}/{} failed: {}", self.attempts, max_attempts, error);
        self.last_error = Some(error);

        match self.policy.should_retry(self.attempts, self.elapsed_ms()) {
            RetryOutcome::Retry => {
                let delay = self.policy.calculate_delay(self.attempts - 1, self.risk_score);
                self.total_delay_ms = self.total_delay_ms.saturating_add(delay);
                get_metrics().record_retry_delay(self.strategy(), delay);
                tracing::debug!(
                    "Waiting {}ms before retry (attempt {}/{}, risk_score={:.2})",
                    delay,
                    self.attempts,
                    max_attempts,
                    self.risk_score
                );
                Step::Wait(delay)
            }
            RetryOutcome::Abort => {
                tracing::warn!("Retry timeout reached: {}ms", self.elapsed_ms());
                Step::Stop(RetryOutcome::Abort)
            }
            outcome => Step::Stop(outcome),
        }
    }

    fn succeed<T>(self, value: T) -> RetryResult<T> {
        get_metrics().record_retry_attempt(self.strategy(), true);
        let attempts = self.attempts + 1;
        self.finish(RetryOutcome::Success, attempts, Some(value))
    }

    fn stop<T>(self, outcome: RetryOutcome) -> RetryResult<T> {
        let attempts = self.attempts;
        self.finish(outcome, attempts, None)
    }

    fn finish<T>(self, outcome: RetryOutcome, attempts: u32, value: Option<T>) -> RetryResult<T> {
        let mut metadata = Map::new();
        metadata.insert("elapsed_ms".to_string(), Value::from(self.elapsed_ms()));
        if outcome == RetryOutcome::Abort {
            metadata.insert("reason".to_string(), Value::from("timeout"));
        }
        if let Some(context) = self.context {
            metadata.insert("context".to_string(), context);
        }

        get_metrics().record_retry_outcome(self.policy.config().strategy.as_str(), outcome.as_str(), attempts);

        RetryResult {
            outcome,
            attempts,
            total_delay_ms: self.total_delay_ms,
            last_error: self.last_error,
            success: outcome == RetryOutcome::Success,
            value,
            metadata,
        }
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls `operation` until it succeeds, attempts run out, or the
    /// configured timeout passes. Waits block the calling thread.
    pub fn execute_with_retry<T, E, F>(
        &self,
        mut operation: F,
        risk_score: f64,
        context: Option<Value>,
    ) -> RetryResult<T>
    where
        F: FnMut() -> std::result::Result<T, E>,
        E: Display,
    {
        let mut state = RetryLoop::new(&self.policy, risk_score, context);

        while state.has_attempts_left() {
            match operation() {
                Ok(value) => return state.succeed(value),
                Err(e) => match state.on_failure(e.to_string()) {
                    Step::Wait(delay) => std::thread::sleep(Duration::from_millis(delay)),
                    Step::Stop(outcome) => return state.stop(outcome),
                },
            }
        }

        state.stop(RetryOutcome::Exhausted)
    }

    /// Async variant of [`execute_with_retry`](Self::execute_with_retry);
    /// waits suspend only the calling task.
    pub async fn execute_with_retry_async<T, E, F, Fut>(
        &self,
        mut operation: F,
        risk_score: f64,
        context: Option<Value>,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let mut state = RetryLoop::new(&self.policy, risk_score, context);

        while state.has_attempts_left() {
            match operation().await {
                Ok(value) => return state.succeed(value),
                Err(e) => match state.on_failure(e.to_string()) {
                    Step::Wait(delay) => tokio::time::sleep(Duration::from_millis(delay)).await,
                    Step::Stop(outcome) => return state.stop(outcome),
                },
            }
        }

        state.stop(RetryOutcome::Exhausted)
    }
}
