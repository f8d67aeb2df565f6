mod common;

use chrono::{Duration, Utc};
use reliability_core::error::AppError;
use reliability_core::idempotency::{
    Execution, IdempotencyCleanupJob, IdempotencyKey, IdempotencyManager,
    IdempotencyManagerConfig, IdempotencyRecord, IdempotencyStatus, IdempotencyStorage,
    PostgresIdempotencyStore, RedisIdempotencyStore,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AnalysisReport {
    findings: u32,
    verdict: String,
}

fn pr_key() -> IdempotencyKey {
    IdempotencyKey::pr_analysis(common::org_id(), "r/r", 42, "abc")
}

#[tokio::test]
async fn test_completed_result_is_replayed() {
    let (_, manager) = common::memory_manager();
    let key = pr_key();

    let first = manager.check(&key, None).await.unwrap();
    assert!(!first.is_duplicate);
    assert_eq!(first.record.status, IdempotencyStatus::InProgress);

    manager
        .complete(&key, serde_json::json!({"status": "ok"}))
        .await
        .unwrap();

    let second = manager.check(&key, None).await.unwrap();
    assert!(second.is_duplicate);
    assert_eq!(second.cached_result, Some(serde_json::json!({"status": "ok"})));
    assert_eq!(second.record.id, first.record.id);
}

#[tokio::test]
async fn test_second_check_without_outcome_is_duplicate() {
    let (_, manager) = common::memory_manager();
    let key = pr_key();

    assert!(!manager.check(&key, None).await.unwrap().is_duplicate);

    let again = manager.check(&key, None).await.unwrap();
    assert!(again.is_duplicate);
    assert!(again.is_in_flight());
    assert!(again.cached_result.is_none());
}

#[tokio::test]
async fn test_failed_record_allows_one_new_attempt() {
    let (storage, manager) = common::memory_manager();
    let key = pr_key();

    let first = manager.check(&key, None).await.unwrap();
    let failed = manager.fail(&key, "analysis crashed").await.unwrap();
    assert_eq!(failed.status, IdempotencyStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("analysis crashed"));

    let retry = manager.check(&key, None).await.unwrap();
    assert!(!retry.is_duplicate);
    assert_ne!(retry.record.id, first.record.id);

    let stored = storage.get_by_key(&key.hash()).await.unwrap().unwrap();
    assert_eq!(stored.id, retry.record.id);
    assert_eq!(stored.status, IdempotencyStatus::InProgress);
    assert!(stored.error.is_none());

    // The new attempt holds the key again.
    assert!(manager.check(&key, None).await.unwrap().is_duplicate);
}

#[tokio::test]
async fn test_release_allows_immediate_retry() {
    let (_, manager) = common::memory_manager();
    let key = pr_key();

    manager.check(&key, None).await.unwrap();
    assert!(manager.release(&key).await.unwrap());
    assert!(!manager.release(&key).await.unwrap());

    assert!(!manager.check(&key, None).await.unwrap().is_duplicate);
}

#[tokio::test]
async fn test_expired_record_is_treated_as_absent() {
    let (storage, manager) = common::memory_manager();
    let key = pr_key();

    let mut stale = IdempotencyRecord::new_in_progress(&key, 60);
    stale.created_at = Utc::now() - Duration::hours(2);
    stale.expires_at = Some(Utc::now() - Duration::hours(1));
    storage.insert_raw(stale.clone()).await;

    let check = manager.check(&key, None).await.unwrap();
    assert!(!check.is_duplicate);
    assert_ne!(check.record.id, stale.id);
}

#[tokio::test]
async fn test_expired_completed_result_is_not_replayed() {
    let (storage, manager) = common::memory_manager();
    let key = pr_key();

    let mut old = IdempotencyRecord::new_in_progress(&key, 60);
    old.mark_completed(serde_json::json!({"status": "stale"}));
    old.expires_at = Some(Utc::now() - Duration::seconds(1));
    storage.insert_raw(old).await;

    let check = manager.check(&key, None).await.unwrap();
    assert!(!check.is_duplicate);
    assert!(check.cached_result.is_none());
}

#[tokio::test]
async fn test_custom_ttl_sets_expiry() {
    let (_, manager) = common::memory_manager();

    let check = manager.check(&pr_key(), Some(120)).await.unwrap();
    let ttl = check.record.expires_at.unwrap() - check.record.created_at;
    assert_eq!(ttl.num_seconds(), 120);
}

#[tokio::test]
async fn test_complete_and_fail_require_check() {
    let (_, manager) = common::memory_manager();
    let key = pr_key();

    let err = manager.complete(&key, serde_json::json!({})).await.unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));

    let err = manager.fail(&key, "boom").await.unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_cleanup_removes_exactly_expired_records() {
    let (storage, manager) = common::memory_manager();

    for i in 0..3 {
        let key = IdempotencyKey::new(common::org_id(), "expired").with_discriminator(i.to_string());
        let mut record = IdempotencyRecord::new_in_progress(&key, 60);
        record.expires_at = Some(Utc::now() - Duration::minutes(i + 1));
        storage.insert_raw(record).await;
    }
    for i in 0..2 {
        let key = IdempotencyKey::new(common::org_id(), "live").with_discriminator(i.to_string());
        manager.check(&key, Some(3600)).await.unwrap();
    }

    assert_eq!(manager.cleanup().await.unwrap(), 3);
    assert_eq!(storage.len().await, 2);
    assert_eq!(manager.cleanup().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cleanup_job_run_once() {
    let (storage, manager) = common::memory_manager();

    let key = IdempotencyKey::new(common::org_id(), "expired");
    let mut record = IdempotencyRecord::new_in_progress(&key, 60);
    record.expires_at = Some(Utc::now() - Duration::minutes(5));
    storage.insert_raw(record).await;

    let job = IdempotencyCleanupJob::new(manager, 60);
    assert_eq!(job.run_once().await.unwrap(), 1);
    assert!(storage.is_empty().await);
}

#[tokio::test]
async fn test_concurrent_checks_on_in_progress_key_both_decline() {
    let (_, manager) = common::memory_manager();
    let key = IdempotencyKey::new(common::org_id(), "check_run_create").with_discriminator("lint");

    let owner = manager.check(&key, None).await.unwrap();
    assert!(!owner.is_duplicate);

    let (a, b) = tokio::join!(manager.check(&key, None), manager.check(&key, None));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.is_duplicate && b.is_duplicate);
    assert!(a.cached_result.is_none() && b.cached_result.is_none());
    assert_eq!(a.record.id, owner.record.id);
    assert_eq!(b.record.id, owner.record.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_checks_on_absent_key_admit_exactly_one() {
    let (_, manager) = common::memory_manager();
    let key = IdempotencyKey::new(common::org_id(), "check_run_create").with_discriminator("lint");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move { manager.check(&key, None).await }));
    }

    let mut new_operations = 0;
    for handle in handles {
        let check = handle.await.unwrap().unwrap();
        if !check.is_duplicate {
            new_operations += 1;
        }
    }

    assert_eq!(new_operations, 1);
    let snapshot = manager.metrics().snapshot();
    assert_eq!(snapshot.total_requests, 16);
    assert_eq!(snapshot.new_requests, 1);
    assert_eq!(snapshot.duplicate_requests, 15);
}

#[tokio::test]
async fn test_execute_runs_once_then_replays() {
    let (_, manager) = common::memory_manager();
    let key = IdempotencyKey::report_generation(common::org_id(), "r/r", "abc", "sbom");
    let report = AnalysisReport {
        findings: 3,
        verdict: "needs-review".to_string(),
    };

    let first = manager
        .execute(&key, None, || async { Ok(report.clone()) })
        .await
        .unwrap();
    assert_eq!(first, Execution::Executed(report.clone()));

    let runs = AtomicUsize::new(0);
    let second = manager
        .execute(&key, None, || async {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(AnalysisReport {
                findings: 0,
                verdict: String::new(),
            })
        })
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(second, Execution::Cached(report));
}

#[tokio::test]
async fn test_execute_records_failure_and_allows_retry() {
    let (storage, manager) = common::memory_manager();
    let key = pr_key();

    let err = manager
        .execute::<AnalysisReport, _, _>(&key, None, || async {
            Err(AppError::Storage("upstream unavailable".to_string()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Storage(_)));

    let record = storage.get_by_key(&key.hash()).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);

    let retried = manager
        .execute(&key, None, || async {
            Ok(AnalysisReport {
                findings: 0,
                verdict: "clean".to_string(),
            })
        })
        .await
        .unwrap();
    assert!(matches!(retried, Execution::Executed(_)));
}

#[tokio::test]
async fn test_execute_reports_in_progress_duplicate() {
    let (_, manager) = common::memory_manager();
    let key = pr_key();

    manager.check(&key, None).await.unwrap();

    let outcome = manager
        .execute::<AnalysisReport, _, _>(&key, None, || async {
            Err(AppError::Validation("must not run".to_string()))
        })
        .await
        .unwrap();
    assert_eq!(outcome, Execution::InProgress);
}

#[tokio::test]
async fn test_guard_typed_result_round_trip() {
    let (_, manager) = common::memory_manager();
    let key = pr_key();
    let report = AnalysisReport {
        findings: 1,
        verdict: "blocked".to_string(),
    };

    let mut guard = manager.guard(key.clone(), None).await.unwrap();
    guard.complete_with(&report).await.unwrap();
    guard.exit(None).await.unwrap();

    let replay = manager.guard(key, None).await.unwrap();
    assert!(replay.is_duplicate());
    assert_eq!(replay.cached_as::<AnalysisReport>().unwrap(), Some(report));
    replay.exit(None).await.unwrap();
}

#[tokio::test]
async fn test_cache_serves_completed_and_is_evicted_on_release() {
    let (_, manager) = common::memory_manager_with(IdempotencyManagerConfig {
        cache_enabled: true,
        ..Default::default()
    });
    let key = pr_key();

    manager.check(&key, None).await.unwrap();
    manager.complete(&key, serde_json::json!({"status": "ok"})).await.unwrap();

    let replay = manager.check(&key, None).await.unwrap();
    assert!(replay.is_duplicate);
    assert_eq!(manager.metrics().snapshot().cache_hits, 1);

    manager.release(&key).await.unwrap();
    assert!(!manager.check(&key, None).await.unwrap().is_duplicate);
    assert_eq!(manager.metrics().snapshot().cache_hits, 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn test_postgres_store_lifecycle() {
    let pool = common::setup_test_db().await;
    let store = PostgresIdempotencyStore::new(pool.clone());
    let manager = IdempotencyManager::with_default_config(std::sync::Arc::new(PostgresIdempotencyStore::new(pool.clone())));

    let key = IdempotencyKey::pr_analysis(Uuid::new_v4(), "r/r", 42, "abc");

    assert!(!manager.check(&key, None).await.unwrap().is_duplicate);
    assert!(manager.check(&key, None).await.unwrap().is_duplicate);

    manager
        .complete(&key, serde_json::json!({"status": "ok"}))
        .await
        .unwrap();
    let replay = manager.check(&key, None).await.unwrap();
    assert_eq!(replay.cached_result, Some(serde_json::json!({"status": "ok"})));

    let stored = store.get_by_key(&key.hash()).await.unwrap().unwrap();
    assert_eq!(stored.status, IdempotencyStatus::Completed);
    assert!(stored.completed_at.is_some());
    assert!(store.count_by_status(IdempotencyStatus::Completed).await.unwrap() >= 1);

    assert!(manager.release(&key).await.unwrap());
    assert!(store.get_by_key(&key.hash()).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn test_postgres_store_create_if_absent_and_cleanup() {
    let pool = common::setup_test_db().await;
    let store = PostgresIdempotencyStore::new(pool.clone());

    let key = IdempotencyKey::new(Uuid::new_v4(), "expired");
    let mut record = IdempotencyRecord::new_in_progress(&key, 60);
    record.expires_at = Some(Utc::now() - Duration::hours(1));

    store.save(record.clone()).await.unwrap();
    let err = store.save(record.clone()).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    assert!(store.cleanup_expired().await.unwrap() >= 1);
    assert!(store.get_by_key(&key.hash()).await.unwrap().is_none());

    common::cleanup_idempotency_data(&pool).await;
}

#[tokio::test]
#[ignore = "requires Redis (REDIS_URL)"]
async fn test_redis_store_lifecycle() {
    let store = std::sync::Arc::new(RedisIdempotencyStore::new(common::redis_client(), "idem-test"));
    let manager = IdempotencyManager::with_default_config(store.clone());
    let key = IdempotencyKey::check_run(Uuid::new_v4(), "r/r", "abc", "lint");

    assert!(!manager.check(&key, Some(60)).await.unwrap().is_duplicate);
    assert!(manager.check(&key, Some(60)).await.unwrap().is_duplicate);

    manager.fail(&key, "lint crashed").await.unwrap();
    let stored = store.get_by_key(&key.hash()).await.unwrap().unwrap();
    assert_eq!(stored.status, IdempotencyStatus::Failed);

    assert!(!manager.check(&key, Some(60)).await.unwrap().is_duplicate);
    assert!(manager.release(&key).await.unwrap());
    assert_eq!(store.cleanup_expired().await.unwrap(), 0);
}
