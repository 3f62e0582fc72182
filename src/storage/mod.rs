use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

pub mod models;
pub mod recorder;
pub mod state;

pub use recorder::{OpportunityRecorder, PairRecorder, RiskRecorder, TradeRecorder};
pub use state::RedisRiskStore;

pub type PgPool = Pool<Postgres>;

/// Create a PostgreSQL/TimescaleDB connection pool.
///
/// Small, conservative pool for a single bot instance; connecting eagerly
/// surfaces misconfiguration at startup instead of at first trade.
pub async fn create_pg_pool(url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(15))
        .connect(url)
        .await?;
    Ok(pool)
}

/// Create a Redis client for the day-scoped risk-state store.
pub fn create_redis_client(url: &str) -> anyhow::Result<redis::Client> {
    let client = redis::Client::open(url)?;
    Ok(client)
}
