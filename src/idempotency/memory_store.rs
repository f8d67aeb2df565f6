//! In-memory implementation of `IdempotencyStorage`.
//!
//! All records live in a `HashMap` behind a `RwLock` and are lost on restart.
//! `save` is create-if-absent under the write lock, so concurrent callers in
//! one process cannot both create a record for the same key.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::storage::{IdempotencyRecord, IdempotencyStorage};
use crate::error::{AppError, Result};

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Inserts or replaces a record without the create-if-absent check.
    pub async fn insert_raw(&self, record: IdempotencyRecord) {
        let mut records = self.records.write().await;
        records.insert(record.key_hash.clone(), record);
    }
}

#[async_trait]
impl IdempotencyStorage for InMemoryIdempotencyStore {
    async fn get_by_key(&self, key_hash: &str) -> Result<Option<IdempotencyRecord>> {
        let records = self.records.read().await;
        Ok(records.get(key_hash).cloned())
    }

    async fn save(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.key_hash) {
            return Err(AppError::Conflict(format!(
                "idempotency record already exists for key hash {}",
                record.key_hash
            )));
        }
        records.insert(record.key_hash.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.key_hash) {
            Some(existing) => {
                *existing = record.clone();
                Ok(record)
            }
            None => Err(AppError::NotFound(format!(
                "idempotency record for key hash {}",
                record.key_hash
            ))),
        }
    }

    async fn delete(&self, key_hash: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        Ok(records.remove(key_hash).is_some())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired_at(now));
        Ok((before - records.len()) as u64)
    }
}
