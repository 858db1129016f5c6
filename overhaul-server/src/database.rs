use std::time::Duration;

use overhaul_core::SyncResult;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::instrument;

use crate::config::Config;

#[instrument(skip(config))]
pub async fn connect(config: &Config) -> SyncResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_max)
        .idle_timeout(Duration::from_millis(config.pool_idle_ms))
        .acquire_timeout(Duration::from_millis(config.pool_connect_ms))
        .connect(&config.database_url())
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> SyncResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
