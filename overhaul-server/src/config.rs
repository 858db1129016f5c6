//! Process-wide configuration, read from the environment once at startup and
//! immutable afterward.

use std::env;
use std::fmt::Debug;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_host: String,
    pub database_port: u16,
    pub database_name: String,
    pub database_user: String,
    pub database_password: String,
    pub pool_max: u32,
    pub pool_idle_ms: u64,
    pub pool_connect_ms: u64,
    pub pull_max_batch: i64,
    pub push_max_batch: usize,
    pub bind_address: String,
    pub request_timeout_ms: u64,
    pub max_concurrent_syncs: usize,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy + Debug,
{
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "unparseable value, using default {default:?}");
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_host: var_or("OVH_DATABASE_HOST", "localhost"),
            database_port: parse_or("OVH_DATABASE_PORT", 5432),
            database_name: var_or("OVH_DATABASE_NAME", "overhaul"),
            database_user: var_or("OVH_DATABASE_USER", "overhaul"),
            database_password: var_or("OVH_DATABASE_PASSWORD", ""),
            pool_max: parse_or("OVH_POOL_MAX", 10),
            pool_idle_ms: parse_or("OVH_POOL_IDLE_MS", 30_000),
            pool_connect_ms: parse_or("OVH_POOL_CONNECT_MS", 5_000),
            pull_max_batch: parse_or("OVH_PULL_MAX_BATCH", 1_000),
            push_max_batch: parse_or("OVH_PUSH_MAX_BATCH", 1_000),
            bind_address: var_or("OVH_BIND_ADDRESS", "0.0.0.0:8080"),
            request_timeout_ms: parse_or("OVH_REQUEST_TIMEOUT_MS", 30_000),
            max_concurrent_syncs: parse_or("OVH_MAX_CONCURRENT_SYNCS", 64),
            admin_username: env::var("OVH_ADMIN_USERNAME").ok(),
            admin_password: env::var("OVH_ADMIN_PASSWORD").ok(),
        }
    }

    /// Connection string for the pool. A full `DATABASE_URL` takes precedence
    /// over the individual parts, which is what tests and container setups
    /// usually provide.
    pub fn database_url(&self) -> String {
        if let Ok(url) = env::var("DATABASE_URL") {
            return url;
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database_user,
            self.database_password,
            self.database_host,
            self.database_port,
            self.database_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = Config {
            database_host: "localhost".into(),
            database_port: 5432,
            database_name: "overhaul".into(),
            database_user: "overhaul".into(),
            database_password: "".into(),
            pool_max: 10,
            pool_idle_ms: 30_000,
            pool_connect_ms: 5_000,
            pull_max_batch: 1_000,
            push_max_batch: 1_000,
            bind_address: "0.0.0.0:8080".into(),
            request_timeout_ms: 30_000,
            max_concurrent_syncs: 64,
            admin_username: None,
            admin_password: None,
        };
        assert_eq!(cfg.pool_max, 10);
        assert_eq!(cfg.pull_max_batch, 1_000);
        assert!(cfg
            .database_url()
            .ends_with("/overhaul") || std::env::var("DATABASE_URL").is_ok());
    }
}
