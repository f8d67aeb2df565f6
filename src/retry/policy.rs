use rand::Rng;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::Result;

/// Backoff algorithm used to derive the delay before a retry.
///
/// Deserializes through [`From<&str>`], so unknown names in configuration
/// fall back to `Exponential` with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", from = "String")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
    RiskAdaptive,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Fibonacci => "fibonacci",
            RetryStrategy::RiskAdaptive => "risk-adaptive",
        }
    }
}

/// Unknown names fall back to `Exponential`.
impl From<&str> for RetryStrategy {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "exponential" => RetryStrategy::Exponential,
            "linear" => RetryStrategy::Linear,
            "fixed" => RetryStrategy::Fixed,
            "fibonacci" => RetryStrategy::Fibonacci,
            "risk-adaptive" | "risk_adaptive" => RetryStrategy::RiskAdaptive,
            other => {
                tracing::warn!("Invalid retry strategy '{}', using 'exponential'", other);
                RetryStrategy::Exponential
            }
        }
    }
}

impl From<String> for RetryStrategy {
    fn from(s: String) -> Self {
        RetryStrategy::from(s.as_str())
    }
}

/// Outcome of a retry decision or of a whole retried execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryOutcome {
    Success,
    Retry,
    Exhausted,
    Abort,
}

impl RetryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryOutcome::Success => "success",
            RetryOutcome::Retry => "retry",
            RetryOutcome::Exhausted => "exhausted",
            RetryOutcome::Abort => "abort",
        }
    }
}

/// Configuration for retry policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_retry_config"))]
pub struct RetryConfig {
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_enabled: bool,
    #[validate(range(min = 0.0))]
    pub jitter_min: f64,
    #[validate(range(min = 0.0))]
    pub jitter_max: f64,
    pub strategy: RetryStrategy,
    #[validate(range(min = 0.0))]
    pub backoff_multiplier: f64,
    /// Scale non-risk-adaptive strategies by `1 + risk_score` after jitter.
    pub risk_adaptive: bool,
    /// Bound on total wall-clock time, checked before each wait.
    pub timeout_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2000,
            max_delay_ms: 30000,
            jitter_enabled: true,
            jitter_min: 0.8,
            jitter_max: 1.2,
            strategy: RetryStrategy::Exponential,
            backoff_multiplier: 2.0,
            risk_adaptive: true,
            timeout_ms: None,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with jitter, scaled by the caller's risk score.
    pub fn risk_adaptive_preset() -> Self {
        Self {
            strategy: RetryStrategy::RiskAdaptive,
            ..Self::default()
        }
    }
}

fn validate_retry_config(config: &RetryConfig) -> std::result::Result<(), ValidationError> {
    if config.jitter_min > config.jitter_max {
        return Err(ValidationError::new("jitter_min_exceeds_jitter_max"));
    }
    if config.max_delay_ms < config.base_delay_ms {
        return Err(ValidationError::new("max_delay_below_base_delay"));
    }
    Ok(())
}

/// Stateless delay calculation over a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        tracing::debug!(
            "RetryPolicy initialized: strategy={}, max_attempts={}, base_delay={}ms",
            config.strategy.as_str(),
            config.max_attempts,
            config.base_delay_ms
        );
        Self { config }
    }

    /// Validates `config` before building the policy.
    pub fn try_new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Builds a policy from a strategy name; other settings keep their defaults.
    pub fn from_strategy_name(strategy: &str, max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self::new(RetryConfig {
            strategy: RetryStrategy::from(strategy),
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            ..RetryConfig::default()
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay in milliseconds before retry number `attempt` (0-based).
    ///
    /// `risk_score` is clamped to `[0, 1]`; NaN counts as 0. The result is
    /// always within `[0, max_delay_ms]`.
    pub fn calculate_delay(&self, attempt: u32, risk_score: f64) -> u64 {
        let risk = normalize_risk(risk_score);
        let mut delay = self.raw_strategy_delay(attempt, risk);

        if self.config.jitter_enabled {
            delay = self.apply_jitter(delay);
        }

        // RISK_ADAPTIVE already folded the risk in.
        if self.config.risk_adaptive && self.config.strategy != RetryStrategy::RiskAdaptive {
            delay *= 1.0 + risk;
        }

        self.clamp_delay(delay)
    }

    /// Strategy delay before jitter and the extra risk factor, clamped.
    pub fn strategy_delay(&self, attempt: u32, risk_score: f64) -> u64 {
        let risk = normalize_risk(risk_score);
        self.clamp_delay(self.raw_strategy_delay(attempt, risk))
    }

    /// Decides whether another attempt may follow `attempts` failures.
    pub fn should_retry(&self, attempts: u32, elapsed_ms: u64) -> RetryOutcome {
        if attempts >= self.config.max_attempts {
            return RetryOutcome::Exhausted;
        }

        if let Some(timeout_ms) = self.config.timeout_ms.filter(|t| *t > 0) {
            if elapsed_ms >= timeout_ms {
                return RetryOutcome::Abort;
            }
        }

        RetryOutcome::Retry
    }

    fn raw_strategy_delay(&self, attempt: u32, risk: f64) -> f64 {
        let base = self.config.base_delay_ms as f64;
        match self.config.strategy {
            RetryStrategy::Exponential => self.exponential_delay(attempt),
            RetryStrategy::Linear => base * (f64::from(attempt) + 1.0),
            RetryStrategy::Fixed => base,
            RetryStrategy::Fibonacci => base * fibonacci(attempt.saturating_add(1)),
            RetryStrategy::RiskAdaptive => self.exponential_delay(attempt) * (1.0 + risk),
        }
    }

    fn exponential_delay(&self, attempt: u32) -> f64 {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent)
    }

    fn apply_jitter(&self, delay: f64) -> f64 {
        let (min, max) = (self.config.jitter_min, self.config.jitter_max);
        let factor = if min < max {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        delay * factor
    }

    fn clamp_delay(&self, delay: f64) -> u64 {
        if delay.is_nan() {
            return 0;
        }
        delay.clamp(0.0, self.config.max_delay_ms as f64) as u64
    }
}

fn normalize_risk(risk_score: f64) -> f64 {
    if risk_score.is_nan() {
        return 0.0;
    }
    if !(0.0..=1.0).contains(&risk_score) {
        tracing::debug!("Risk score {} outside [0, 1], clamping", risk_score);
    }
    risk_score.clamp(0.0, 1.0)
}

/// nth Fibonacci number as `f64`; large `n` saturates to infinity.
fn fibonacci(n: u32) -> f64 {
    if n <= 1 {
        return f64::from(n);
    }
    let (mut a, mut b) = (0.0_f64, 1.0_f64);
    for _ in 2..=n.min(1_500) {
        let next = a + b;
        a = b;
        b = next;
    }
    b
}

/// Delay for the agent executor's default schedule: risk-adaptive
/// exponential backoff from 2s, capped at 30s, with ±20% jitter.
pub fn executor_retry_delay(attempt: u32, risk_score: f64) -> u64 {
    RetryPolicy::new(RetryConfig::risk_adaptive_preset()).calculate_delay(attempt, risk_score)
}
