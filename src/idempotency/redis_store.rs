use crate::error::{AppError, Result};
use crate::idempotency::storage::{IdempotencyRecord, IdempotencyStorage};
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

const BACKEND: &str = "redis";

/// Redis-based idempotency storage.
///
/// Records are stored as JSON under `{prefix}:{key_hash}`. Keys carry a
/// Redis TTL matching `expires_at`, so expired records disappear on their own
/// and `cleanup_expired` has nothing left to remove.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn make_key(&self, key_hash: &str) -> String {
        format!("{}:{}", self.key_prefix, key_hash)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }

    /// Milliseconds until the record expires, at least 1 so Redis accepts it.
    fn ttl_millis(record: &IdempotencyRecord) -> Option<usize> {
        record.expires_at.map(|expires_at| {
            let remaining = expires_at.signed_duration_since(Utc::now()).num_milliseconds();
            remaining.max(1) as usize
        })
    }

    fn observe<T>(operation: &str, timer: LatencyTimer, result: &Result<T>) {
        get_metrics().record_storage_operation(BACKEND, operation, timer.elapsed_ms(), result.is_ok());
    }

    async fn save_inner(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord> {
        let mut conn = self.connection().await?;
        let key = self.make_key(&record.key_hash);
        let payload = serde_json::to_string(&record)?;

        let mut options = redis::SetOptions::default().conditional_set(redis::ExistenceCheck::NX);
        if let Some(ttl) = Self::ttl_millis(&record) {
            options = options.with_expiration(redis::SetExpiry::PX(ttl));
        }

        let written: Option<String> = conn
            .set_options(&key, payload, options)
            .await
            .map_err(AppError::Redis)?;

        match written {
            Some(_) => Ok(record),
            None => Err(AppError::Conflict(format!(
                "idempotency record already exists for key hash {}",
                record.key_hash
            ))),
        }
    }

    async fn update_inner(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord> {
        let mut conn = self.connection().await?;
        let key = self.make_key(&record.key_hash);
        let payload = serde_json::to_string(&record)?;

        let options = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::XX)
            .with_expiration(redis::SetExpiry::KEEPTTL);

        let written: Option<String> = conn
            .set_options(&key, payload, options)
            .await
            .map_err(AppError::Redis)?;

        match written {
            Some(_) => Ok(record),
            None => Err(AppError::NotFound(format!(
                "idempotency record for key hash {}",
                record.key_hash
            ))),
        }
    }
}

#[async_trait]
impl IdempotencyStorage for RedisIdempotencyStore {
    async fn get_by_key(&self, key_hash: &str) -> Result<Option<IdempotencyRecord>> {
        let timer = LatencyTimer::new();
        let result = async {
            let mut conn = self.connection().await?;
            let value: Option<String> = conn
                .get(self.make_key(key_hash))
                .await
                .map_err(AppError::Redis)?;

            match value {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        }
        .await;

        Self::observe("get_by_key", timer, &result);
        result
    }

    async fn save(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord> {
        let timer = LatencyTimer::new();
        let result = self.save_inner(record).await;
        Self::observe("save", timer, &result);
        result
    }

    async fn update(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord> {
        let timer = LatencyTimer::new();
        let result = self.update_inner(record).await;
        Self::observe("update", timer, &result);
        result
    }

    async fn delete(&self, key_hash: &str) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result = async {
            let mut conn = self.connection().await?;
            let deleted: i64 = conn
                .del(self.make_key(key_hash))
                .await
                .map_err(AppError::Redis)?;
            Ok(deleted > 0)
        }
        .await;

        Self::observe("delete", timer, &result);
        result
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        Ok(0)
    }
}
