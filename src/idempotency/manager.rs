use crate::error::{AppError, Result};
use crate::idempotency::guard::IdempotencyGuard;
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::storage::{IdempotencyRecord, IdempotencyStatus, IdempotencyStorage};
use crate::observability::{get_metrics, mask_sensitive, mask_uuid};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use validator::Validate;

/// Create attempts per check before a persistent conflict is reported.
const MAX_CREATE_ATTEMPTS: u32 = 3;

/// Metrics for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub duplicate_requests: AtomicU64,
    pub new_requests: AtomicU64,
    pub completed_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub released_requests: AtomicU64,
    pub cache_hits: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.new_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self) {
        self.released_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            duplicate_requests: self.duplicate_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            released_requests: self.released_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub duplicate_requests: u64,
    pub new_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub released_requests: u64,
    pub cache_hits: u64,
}

impl MetricsSnapshot {
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.duplicate_requests as f64 / self.total_requests as f64
        }
    }
}

/// Verdict of [`IdempotencyManager::check`].
#[derive(Debug, Clone)]
pub struct IdempotencyCheck {
    pub is_duplicate: bool,
    pub record: IdempotencyRecord,
    /// Stored result of a completed duplicate; `None` for a new operation
    /// and for a duplicate that is still in progress.
    pub cached_result: Option<serde_json::Value>,
}

impl IdempotencyCheck {
    fn new_operation(record: IdempotencyRecord) -> Self {
        Self {
            is_duplicate: false,
            record,
            cached_result: None,
        }
    }

    fn duplicate(record: IdempotencyRecord) -> Self {
        let cached_result = if record.is_completed() {
            record.result.clone()
        } else {
            None
        };
        Self {
            is_duplicate: true,
            record,
            cached_result,
        }
    }

    /// True when another caller holds the key and has not finished yet.
    pub fn is_in_flight(&self) -> bool {
        self.is_duplicate && self.record.is_in_progress()
    }

    /// Deserializes the cached result into `T`.
    pub fn cached_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.cached_result
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(AppError::from)
    }
}

/// Outcome of [`IdempotencyManager::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum Execution<T> {
    /// The operation ran in this call.
    Executed(T),
    /// A previous run completed; its stored result is returned.
    Cached(T),
    /// Another caller is running the operation right now.
    InProgress,
}

/// Configuration for the idempotency manager.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IdempotencyManagerConfig {
    #[validate(range(min = 1))]
    pub default_ttl_seconds: i64,
    /// Mirror records into a process-local cache that answers repeat
    /// checks for completed operations without touching storage.
    pub cache_enabled: bool,
}

impl Default for IdempotencyManagerConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 86400, // 24 hours
            cache_enabled: false,
        }
    }
}

/// Coordinates check / complete / fail / release against an
/// [`IdempotencyStorage`].
///
/// Cloning is cheap and clones share storage, cache and metrics.
#[derive(Clone)]
pub struct IdempotencyManager {
    storage: Arc<dyn IdempotencyStorage>,
    cache: Arc<RwLock<HashMap<String, IdempotencyRecord>>>,
    metrics: Arc<IdempotencyMetrics>,
    config: IdempotencyManagerConfig,
}

impl IdempotencyManager {
    pub fn new(storage: Arc<dyn IdempotencyStorage>, config: IdempotencyManagerConfig) -> Self {
        Self {
            storage,
            cache: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(IdempotencyMetrics::new()),
            config,
        }
    }

    pub fn with_default_config(storage: Arc<dyn IdempotencyStorage>) -> Self {
        Self::new(storage, IdempotencyManagerConfig::default())
    }

    pub fn config(&self) -> &IdempotencyManagerConfig {
        &self.config
    }

    /// Gets the metrics for this manager.
    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Checks whether `key` is a duplicate, creating an in-progress record if not.
    pub async fn check(&self, key: &IdempotencyKey, ttl_seconds: Option<i64>) -> Result<IdempotencyCheck> {
        self.check_with_request_id(key, ttl_seconds, None).await
    }

    /// Like [`check`](Self::check), tagging a newly created record with `request_id`.
    pub async fn check_with_request_id(
        &self,
        key: &IdempotencyKey,
        ttl_seconds: Option<i64>,
        request_id: Option<&str>,
    ) -> Result<IdempotencyCheck> {
        self.metrics.record_request();
        let key_hash = key.hash();

        if let Some(record) = self.cached_completed(&key_hash).await {
            self.metrics.record_cache_hit();
            get_metrics().record_idempotency_cache_hit(&key.operation_type);
            return Ok(self.duplicate_verdict(key, record));
        }

        let ttl = ttl_seconds
            .filter(|ttl| *ttl > 0)
            .unwrap_or(self.config.default_ttl_seconds);

        let mut last_conflict = None;
        for _ in 0..MAX_CREATE_ATTEMPTS {
            if let Some(record) = self.storage.get_by_key(&key_hash).await? {
                if let Some(duplicate) = self.live_duplicate(key, &key_hash, record).await? {
                    return Ok(duplicate);
                }
            }

            let mut record = IdempotencyRecord::new_in_progress(key, ttl);
            if let Some(request_id) = request_id {
                record = record.with_request_id(request_id);
            }

            match self.storage.save(record).await {
                Ok(saved) => return Ok(self.new_operation(key, &key_hash, saved).await),
                Err(AppError::Conflict(reason)) => {
                    // Lost the create race; re-read and decide on the winner's record.
                    tracing::debug!("Idempotency create conflict, re-reading: {}", masked(&key_hash));
                    last_conflict = Some(reason);
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Conflict(last_conflict.unwrap_or_else(|| {
            format!("idempotency record for {} kept changing", key.operation_type)
        })))
    }

    /// Duplicate verdict for a live COMPLETED or IN_PROGRESS record. FAILED
    /// and expired records are deleted and yield `None`.
    async fn live_duplicate(
        &self,
        key: &IdempotencyKey,
        key_hash: &str,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyCheck>> {
        if record.is_expired() {
            tracing::debug!("Idempotency record expired, superseding: {}", masked(key_hash));
        } else {
            match record.status {
                IdempotencyStatus::Completed | IdempotencyStatus::InProgress => {
                    return Ok(Some(self.duplicate_verdict(key, record)));
                }
                IdempotencyStatus::Failed => {
                    tracing::debug!("Idempotency hit (failed, allowing retry): {}", masked(key_hash));
                }
            }
        }

        self.storage.delete(key_hash).await?;
        self.evict(key_hash).await;
        Ok(None)
    }

    async fn new_operation(&self, key: &IdempotencyKey, key_hash: &str, record: IdempotencyRecord) -> IdempotencyCheck {
        if self.config.cache_enabled {
            self.cache.write().await.insert(key_hash.to_string(), record.clone());
        }

        self.metrics.record_new();
        get_metrics().record_idempotency_check(&key.operation_type, "new");
        tracing::debug!(
            "Idempotency miss, new record: {} org={}",
            masked(key_hash),
            mask_uuid(&key.org_id)
        );

        IdempotencyCheck::new_operation(record)
    }

    /// Marks the operation as completed; the result is returned to later duplicates.
    pub async fn complete(&self, key: &IdempotencyKey, result: serde_json::Value) -> Result<IdempotencyRecord> {
        let key_hash = key.hash();
        let mut record = self.existing_record(key, &key_hash, "complete").await?;

        record.mark_completed(result);
        let record = self.storage.update(record).await?;

        if self.config.cache_enabled {
            self.cache.write().await.insert(key_hash.clone(), record.clone());
        }

        self.metrics.record_completed();
        get_metrics().record_idempotency_completed(&key.operation_type);
        tracing::debug!("Idempotency completed: {}", masked(&key_hash));

        Ok(record)
    }

    /// Serializes `result` and marks the operation as completed.
    pub async fn complete_with<T: Serialize>(&self, key: &IdempotencyKey, result: &T) -> Result<IdempotencyRecord> {
        let value = serde_json::to_value(result)?;
        self.complete(key, value).await
    }

    /// Marks the operation as failed; the next check may run it again.
    pub async fn fail(&self, key: &IdempotencyKey, error: &str) -> Result<IdempotencyRecord> {
        let key_hash = key.hash();
        let mut record = self.existing_record(key, &key_hash, "fail").await?;

        record.mark_failed(error);
        let record = self.storage.update(record).await?;
        self.evict(&key_hash).await;

        self.metrics.record_failed();
        get_metrics().record_idempotency_failed(&key.operation_type);
        tracing::debug!("Idempotency failed: {} error={}", masked(&key_hash), error);

        Ok(record)
    }

    /// Deletes the record without storing a result so the key can be reused at once.
    pub async fn release(&self, key: &IdempotencyKey) -> Result<bool> {
        let key_hash = key.hash();

        let removed = self.storage.delete(&key_hash).await?;
        self.evict(&key_hash).await;

        self.metrics.record_released();
        get_metrics().record_idempotency_released(&key.operation_type);
        tracing::debug!("Idempotency released: {}", masked(&key_hash));

        Ok(removed)
    }

    /// Opens a scoped guard for `key`. See [`IdempotencyGuard`].
    pub async fn guard(&self, key: IdempotencyKey, ttl_seconds: Option<i64>) -> Result<IdempotencyGuard> {
        IdempotencyGuard::enter(self.clone(), key, ttl_seconds).await
    }

    /// Runs `operation` at most once for `key`.
    ///
    /// A completed duplicate yields its cached result, an in-flight duplicate
    /// yields [`Execution::InProgress`]. Operation errors are recorded with
    /// `fail` and returned.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &IdempotencyKey,
        ttl_seconds: Option<i64>,
        operation: F,
    ) -> Result<Execution<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = self.guard(key.clone(), ttl_seconds).await?;

        if guard.is_duplicate() {
            return Ok(match guard.cached_as::<T>()? {
                Some(cached) => Execution::Cached(cached),
                None => Execution::InProgress,
            });
        }

        match operation().await {
            Ok(value) => {
                guard.complete_with(&value).await?;
                Ok(Execution::Executed(value))
            }
            Err(e) => {
                if let Err(mark_err) = guard.exit(Some(&e.to_string())).await {
                    tracing::error!("Failed to mark idempotency key as failed: {}", mark_err);
                }
                Err(e)
            }
        }
    }

    /// Removes expired records from storage and the local cache.
    pub async fn cleanup(&self) -> Result<u64> {
        let count = self.storage.cleanup_expired().await?;

        if self.config.cache_enabled {
            let now = Utc::now();
            self.cache.write().await.retain(|_, record| !record.is_expired_at(now));
        }

        get_metrics().record_idempotency_cleanup(count);
        tracing::info!("Cleaned up {} expired idempotency records", count);
        Ok(count)
    }

    async fn cached_completed(&self, key_hash: &str) -> Option<IdempotencyRecord> {
        if !self.config.cache_enabled {
            return None;
        }

        let cache = self.cache.read().await;
        cache
            .get(key_hash)
            .filter(|record| record.is_completed() && !record.is_expired())
            .cloned()
    }

    async fn evict(&self, key_hash: &str) {
        if self.config.cache_enabled {
            self.cache.write().await.remove(key_hash);
        }
    }

    async fn existing_record(&self, key: &IdempotencyKey, key_hash: &str, action: &str) -> Result<IdempotencyRecord> {
        let record = self.storage.get_by_key(key_hash).await?.ok_or_else(|| {
            AppError::PreconditionFailed(format!(
                "cannot {} key {}: no idempotency record, call check() first",
                action, key.operation_type
            ))
        })?;

        if record.is_completed() {
            return Err(AppError::PreconditionFailed(format!(
                "cannot {} key {}: operation already completed",
                action, key.operation_type
            )));
        }

        Ok(record)
    }

    fn duplicate_verdict(&self, key: &IdempotencyKey, record: IdempotencyRecord) -> IdempotencyCheck {
        self.metrics.record_duplicate();

        let key_hash = &record.key_hash;
        if record.is_in_progress() {
            tracing::warn!("Idempotency hit (in progress): {}", masked(key_hash));
            get_metrics().record_idempotency_check(&key.operation_type, "in_progress");
        } else {
            tracing::debug!("Idempotency hit ({}): {}", record.status.as_str(), masked(key_hash));
            get_metrics().record_idempotency_check(&key.operation_type, "completed");
        }

        IdempotencyCheck::duplicate(record)
    }
}

fn masked(key_hash: &str) -> String {
    mask_sensitive(key_hash, 6)
}

/// Background cleanup job for expired idempotency records.
pub struct IdempotencyCleanupJob {
    manager: IdempotencyManager,
    interval_seconds: u64,
}

impl IdempotencyCleanupJob {
    pub fn new(manager: IdempotencyManager, interval_seconds: u64) -> Self {
        Self {
            manager,
            interval_seconds,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.manager.cleanup().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(self.interval_seconds.max(1)));

            loop {
                interval.tick().await;

                if let Err(e) = self.manager.cleanup().await {
                    tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                }
            }
        })
    }
}
