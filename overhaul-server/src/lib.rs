pub mod api;
pub mod auth;
pub mod change_log;
pub mod config;
pub mod cursors;
pub mod database;
pub mod ownership;
pub mod pull;
pub mod push;
pub mod sink;
pub mod workflow;

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Semaphore;

pub use config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    /// Bounds concurrent push/pull work; exceeding it yields `rate_limited`.
    pub sync_permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let permits = config.max_concurrent_syncs.max(1);
        Self {
            pool,
            config: Arc::new(config),
            sync_permits: Arc::new(Semaphore::new(permits)),
        }
    }
}
