use crate::error::Result;
use crate::idempotency::key::IdempotencyKey;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::InProgress => "IN_PROGRESS",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }
}

/// Stored idempotency record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub key_hash: String,
    pub key_string: String,
    pub org_id: Uuid,
    pub status: IdempotencyStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub operation_type: String,
    pub request_id: Option<String>,
}

impl IdempotencyRecord {
    /// Creates an in-progress record for `key` that expires `ttl_seconds` from now.
    pub fn new_in_progress(key: &IdempotencyKey, ttl_seconds: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key_hash: key.hash(),
            key_string: key.to_string(),
            org_id: key.org_id,
            status: IdempotencyStatus::InProgress,
            result: None,
            error: None,
            created_at: now,
            completed_at: None,
            expires_at: Some(now + Duration::seconds(ttl_seconds)),
            operation_type: key.operation_type.clone(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// A record without `expires_at` never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == IdempotencyStatus::InProgress
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == IdempotencyStatus::Failed
    }

    pub fn mark_completed(&mut self, result: serde_json::Value) {
        self.status = IdempotencyStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = IdempotencyStatus::Failed;
        self.result = None;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }
}

/// Durable per-key state behind the idempotency manager.
///
/// `save` must be create-if-absent: when a record with the same `key_hash`
/// already exists it returns [`AppError::Conflict`](crate::error::AppError::Conflict)
/// and leaves the stored record untouched. `update` returns
/// [`AppError::NotFound`](crate::error::AppError::NotFound) when the record is gone.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStorage: Send + Sync {
    async fn get_by_key(&self, key_hash: &str) -> Result<Option<IdempotencyRecord>>;

    async fn save(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord>;

    async fn update(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord>;

    async fn delete(&self, key_hash: &str) -> Result<bool>;

    /// Removes every record whose `expires_at` is in the past.
    async fn cleanup_expired(&self) -> Result<u64>;
}
