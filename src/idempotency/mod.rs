pub mod guard;
pub mod key;
pub mod manager;
pub mod memory_store;
pub mod postgres_store;
pub mod redis_store;
pub mod storage;

pub use guard::IdempotencyGuard;
pub use key::IdempotencyKey;
pub use manager::{
    Execution, IdempotencyCheck, IdempotencyCleanupJob, IdempotencyManager,
    IdempotencyManagerConfig, IdempotencyMetrics, MetricsSnapshot,
};
pub use memory_store::InMemoryIdempotencyStore;
pub use postgres_store::PostgresIdempotencyStore;
pub use redis_store::RedisIdempotencyStore;
pub use storage::{IdempotencyRecord, IdempotencyStatus, IdempotencyStorage};
