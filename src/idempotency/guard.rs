//! Scoped acquisition of an idempotency key.
//!
//! ```rust,ignore
//! let mut guard = manager.guard(key, None).await?;
//! if guard.is_duplicate() {
//!     return Ok(guard.cached_result().cloned());
//! }
//!
//! let outcome = do_work().await;
//! if let Ok(response) = &outcome {
//!     guard.complete_with(response).await?;
//! }
//! guard.exit_with(&outcome).await?;
//! ```
//!
//! Exit rules, applied by [`IdempotencyGuard::exit`]:
//!
//! 1. a result was recorded with `complete`, or the attempt was a duplicate: nothing to do;
//! 2. exiting with an error: the record is marked failed;
//! 3. exiting without error and without a result: the record is released.
//!
//! Rule 3 means forgetting to call `complete` is treated as an abandoned
//! attempt, never as success, and the key can be retried immediately.
//!
//! A guard dropped without `exit` (early `?` return, panic, cancelled task)
//! cannot know whether the work failed. It releases the record on the
//! current tokio runtime and logs a warning.

use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::manager::{IdempotencyCheck, IdempotencyManager};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;

pub struct IdempotencyGuard {
    manager: IdempotencyManager,
    key: IdempotencyKey,
    check: IdempotencyCheck,
    completed: bool,
    finished: bool,
}

impl IdempotencyGuard {
    pub(crate) async fn enter(
        manager: IdempotencyManager,
        key: IdempotencyKey,
        ttl_seconds: Option<i64>,
    ) -> Result<Self> {
        let check = manager.check(&key, ttl_seconds).await?;
        Ok(Self {
            manager,
            key,
            check,
            completed: false,
            finished: false,
        })
    }

    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub fn check(&self) -> &IdempotencyCheck {
        &self.check
    }

    pub fn is_duplicate(&self) -> bool {
        self.check.is_duplicate
    }

    pub fn cached_result(&self) -> Option<&serde_json::Value> {
        self.check.cached_result.as_ref()
    }

    pub fn cached_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.check.cached_as()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Records the result of this attempt.
    ///
    /// Duplicates hold no lease on the key and may not record a result.
    pub async fn complete(&mut self, result: serde_json::Value) -> Result<()> {
        if self.is_duplicate() {
            return Err(AppError::PreconditionFailed(format!(
                "duplicate attempt for {} cannot record a result",
                self.key.operation_type
            )));
        }

        self.manager.complete(&self.key, result).await?;
        self.completed = true;
        Ok(())
    }

    pub async fn complete_with<T: Serialize>(&mut self, result: &T) -> Result<()> {
        let value = serde_json::to_value(result)?;
        self.complete(value).await
    }

    /// Leaves the scope, failing the record when `error` is set and
    /// releasing it when no result was recorded.
    pub async fn exit(mut self, error: Option<&str>) -> Result<()> {
        if self.completed || self.is_duplicate() {
            self.finished = true;
            return Ok(());
        }

        match error {
            Some(error) => {
                self.manager.fail(&self.key, error).await?;
            }
            None => {
                self.manager.release(&self.key).await?;
            }
        }

        self.finished = true;
        Ok(())
    }

    /// [`exit`](Self::exit) driven by the outcome of the guarded work.
    pub async fn exit_with<T, E: Display>(self, outcome: &std::result::Result<T, E>) -> Result<()> {
        let error = outcome.as_ref().err().map(|e| e.to_string());
        self.exit(error.as_deref()).await
    }
}

impl Drop for IdempotencyGuard {
    fn drop(&mut self) {
        if self.finished || self.completed || self.check.is_duplicate {
            return;
        }

        tracing::warn!(
            "Idempotency guard for {} dropped without exit; releasing record",
            self.key.operation_type
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                let key = self.key.clone();
                handle.spawn(async move {
                    if let Err(e) = manager.release(&key).await {
                        tracing::error!("Failed to release dropped idempotency guard: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    "No async runtime available; record for {} stays until its TTL expires",
                    self.key.operation_type
                );
            }
        }
    }
}
