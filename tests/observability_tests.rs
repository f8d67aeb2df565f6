use reliability_core::observability::{
    get_metrics, init_metrics, mask_sensitive, mask_uuid, LatencyTimer, LogConfig, LogFormat, Metrics,
};
use uuid::Uuid;

#[test]
fn test_log_config_default() {
    let config = LogConfig::default();
    assert_eq!(config.level, "info");
    assert_eq!(config.format, LogFormat::Pretty);
    assert!(config.include_target);
    assert!(!config.include_file);
    assert!(!config.include_line);
}

#[test]
fn test_log_format_from_str() {
    assert_eq!(LogFormat::from("json"), LogFormat::Json);
    assert_eq!(LogFormat::from("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::from("compact"), LogFormat::Compact);
    assert_eq!(LogFormat::from("pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::from("unknown"), LogFormat::Pretty);
}

#[test]
fn test_mask_sensitive_key_hash() {
    let hash = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
    let masked = mask_sensitive(hash, 6);
    assert!(masked.starts_with("9f86d0"));
    assert!(masked.ends_with("f00a08"));
    assert_eq!(masked.len(), hash.len());
    assert_eq!(masked.matches('*').count(), hash.len() - 12);
}

#[test]
fn test_mask_sensitive_short_values_fully_hidden() {
    assert_eq!(mask_sensitive("abc", 2), "***");
    assert_eq!(mask_sensitive("1234", 2), "****");
    assert_eq!(mask_sensitive("", 2), "");
}

#[test]
fn test_mask_uuid() {
    let uuid = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
    let masked = mask_uuid(&uuid);
    assert!(masked.starts_with("550e"));
    assert!(masked.ends_with("0000"));
    assert!(masked.contains('*'));
    assert_eq!(masked.len(), 36);
}

#[test]
fn test_latency_timer_measures_elapsed_time() {
    let timer = LatencyTimer::new();
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert!(timer.elapsed_ms() >= 5.0);
}

#[test]
fn test_metrics_calls_without_recorder_are_noops() {
    let metrics = Metrics::new();
    metrics.record_idempotency_check("pr_analysis", "new");
    metrics.record_idempotency_cache_hit("pr_analysis");
    metrics.record_idempotency_completed("pr_analysis");
    metrics.record_idempotency_failed("check_run_create");
    metrics.record_idempotency_released("check_run_create");
    metrics.record_idempotency_cleanup(3);
    metrics.record_storage_operation("memory", "save", 0.4, true);
    metrics.record_retry_attempt("exponential", false);
    metrics.record_retry_delay("exponential", 2_000);
    metrics.record_retry_outcome("exponential", "exhausted", 5);
}

#[test]
fn test_init_metrics_is_repeatable() {
    let first = init_metrics().unwrap();
    let second = init_metrics().unwrap();

    get_metrics().record_retry_outcome("fixed", "success", 1);

    assert!(first.render().contains("retry_outcomes_total"));
    assert!(second.render().contains("retry_outcomes_total"));
}
