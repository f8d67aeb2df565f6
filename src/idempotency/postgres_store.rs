use crate::error::{AppError, Result};
use crate::idempotency::storage::{IdempotencyRecord, IdempotencyStatus, IdempotencyStorage};
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use sqlx::PgPool;

const BACKEND: &str = "postgres";

/// PostgreSQL-based idempotency storage.
///
/// Create-if-absent is enforced by the unique index on `key_hash`.
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Counts records by status.
    pub async fn count_by_status(&self, status: IdempotencyStatus) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM idempotency_records WHERE status = $1
            "#,
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }

    fn observe<T>(operation: &str, timer: LatencyTimer, result: &Result<T>) {
        get_metrics().record_storage_operation(BACKEND, operation, timer.elapsed_ms(), result.is_ok());
    }
}

#[async_trait]
impl IdempotencyStorage for PostgresIdempotencyStore {
    async fn get_by_key(&self, key_hash: &str) -> Result<Option<IdempotencyRecord>> {
        let timer = LatencyTimer::new();
        let result = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT id, key_hash, key_string, org_id, status, result, error, created_at, completed_at, expires_at, operation_type, request_id
            FROM idempotency_records
            WHERE key_hash = $1
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database);

        Self::observe("get_by_key", timer, &result);
        result
    }

    async fn save(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord> {
        let timer = LatencyTimer::new();
        let inserted = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            INSERT INTO idempotency_records (id, key_hash, key_string, org_id, status, result, error, created_at, completed_at, expires_at, operation_type, request_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (key_hash) DO NOTHING
            RETURNING id, key_hash, key_string, org_id, status, result, error, created_at, completed_at, expires_at, operation_type, request_id
            "#,
        )
        .bind(record.id)
        .bind(&record.key_hash)
        .bind(&record.key_string)
        .bind(record.org_id)
        .bind(record.status)
        .bind(&record.result)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(record.expires_at)
        .bind(&record.operation_type)
        .bind(&record.request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database);

        // No row returned means another writer holds the key.
        let result = inserted.and_then(|row| {
            row.ok_or_else(|| {
                AppError::Conflict(format!(
                    "idempotency record already exists for key hash {}",
                    record.key_hash
                ))
            })
        });

        Self::observe("save", timer, &result);
        result
    }

    async fn update(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord> {
        let timer = LatencyTimer::new();
        let updated = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            UPDATE idempotency_records
            SET status = $2, result = $3, error = $4, completed_at = $5, expires_at = $6, request_id = $7
            WHERE key_hash = $1
            RETURNING id, key_hash, key_string, org_id, status, result, error, created_at, completed_at, expires_at, operation_type, request_id
            "#,
        )
        .bind(&record.key_hash)
        .bind(record.status)
        .bind(&record.result)
        .bind(&record.error)
        .bind(record.completed_at)
        .bind(record.expires_at)
        .bind(&record.request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database);

        let result = updated.and_then(|row| {
            row.ok_or_else(|| {
                AppError::NotFound(format!("idempotency record for key hash {}", record.key_hash))
            })
        });

        Self::observe("update", timer, &result);
        result
    }

    async fn delete(&self, key_hash: &str) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE key_hash = $1
            "#,
        )
        .bind(key_hash)
        .execute(&self.pool)
        .await
        .map(|done| done.rows_affected() > 0)
        .map_err(AppError::Database);

        Self::observe("delete", timer, &result);
        result
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let timer = LatencyTimer::new();
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE expires_at IS NOT NULL AND expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map(|done| done.rows_affected())
        .map_err(AppError::Database);

        Self::observe("cleanup_expired", timer, &result);
        result
    }
}
