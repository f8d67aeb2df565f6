use reliability_core::config::{Settings, StorageBackend};
use reliability_core::idempotency::{
    IdempotencyCleanupJob, IdempotencyManager, IdempotencyStorage, PostgresIdempotencyStore,
    RedisIdempotencyStore,
};
use reliability_core::observability::{init_logging, init_metrics};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    init_logging(&settings.logging)?;
    init_metrics()?;
    info!("Configuration loaded");

    let storage: Arc<dyn IdempotencyStorage> = match settings.storage.backend {
        StorageBackend::Memory => {
            warn!("Storage backend 'memory' is private to this process; the cleanup janitor has nothing to clean, exiting");
            return Ok(());
        }
        StorageBackend::Postgres => {
            info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(settings.storage.pool_size)
                .acquire_timeout(Duration::from_secs(5))
                .connect(&settings.storage.database_url)
                .await?;

            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Migrations applied successfully");

            Arc::new(PostgresIdempotencyStore::new(pool))
        }
        StorageBackend::Redis => {
            info!("Connecting to Redis...");
            let client = redis::Client::open(settings.storage.redis_url.as_str())?;
            let mut con = client.get_multiplexed_async_connection().await?;
            let _: () = redis::cmd("PING").query_async(&mut con).await?;
            info!("Redis connection established");

            Arc::new(RedisIdempotencyStore::new(client, settings.storage.key_prefix.clone()))
        }
    };

    let manager = IdempotencyManager::new(storage, settings.idempotency.manager_config());
    let cleanup = IdempotencyCleanupJob::new(manager, settings.idempotency.cleanup_interval_seconds).start();
    info!(
        "Idempotency cleanup running every {}s",
        settings.idempotency.cleanup_interval_seconds
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cleanup.abort();

    Ok(())
}
