pub mod executor;
pub mod policy;

pub use executor::{RetryExecutor, RetryResult};
pub use policy::{executor_retry_delay, RetryConfig, RetryOutcome, RetryPolicy, RetryStrategy};
