use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bridge::BridgeConfig;
use bridge::logic::breaker::BreakerConfig;
use bridge::logic::pool::PoolConfig;
use bridge::logic::queue::QueueConfig;
use shared::env::{env_flag, env_or, env_parse};

use crate::cli::CliError;

/// Everything the server reads from the environment, parsed and validated
/// before any resource is touched. Bad values exit with code 2.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_archives: usize,
    pub retention_days: i64,
    pub jwt_issuer: String,
    pub jwt_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub seed_admin: bool,
    pub forbid_loopback: bool,
    pub queue_config: QueueConfig,
    pub pool_config: PoolConfig,
    pub breaker_config: BreakerConfig,
    pub cache_capacity: usize,
    pub cache_default_ttl: Duration,
    pub bridge_config: BridgeConfig,
    pub shutdown_grace: Duration,
}

fn parse<T>(key: &str, default: T) -> Result<T, CliError>
where
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    env_parse(key, default).map_err(|e| CliError::Config(e.to_string()))
}

impl Config {
    pub fn from_env() -> Result<Self, CliError> {
        let bind_addr: SocketAddr = env_or("HEARTH_BIND_ADDR", "127.0.0.1:8700")
            .parse()
            .map_err(|e| CliError::Config(format!("invalid HEARTH_BIND_ADDR: {e}")))?;

        let jwt_ttl_secs: u64 = parse("HEARTH_JWT_TTL_SECS", 3600)?;
        let refresh_ttl_secs: u64 = parse("HEARTH_REFRESH_TTL_SECS", 7 * 24 * 3600)?;
        if jwt_ttl_secs == 0 {
            return Err(CliError::Config("HEARTH_JWT_TTL_SECS must be positive".into()));
        }
        if refresh_ttl_secs < jwt_ttl_secs {
            return Err(CliError::Config(
                "HEARTH_REFRESH_TTL_SECS must be at least HEARTH_JWT_TTL_SECS".into(),
            ));
        }

        let pool_min: usize = parse("HEARTH_POOL_MIN", 1)?;
        let pool_target: usize = parse("HEARTH_POOL_TARGET", 2)?;
        let pool_max: usize = parse("HEARTH_POOL_MAX", 8)?;
        if pool_min == 0 || pool_min > pool_target || pool_target > pool_max {
            return Err(CliError::Config(
                "pool sizes must satisfy 1 <= min <= target <= max".into(),
            ));
        }

        let default_timeout_secs: u64 = parse("HEARTH_REQUEST_TIMEOUT_SECS", 30)?;
        let ceiling_secs: u64 = parse("HEARTH_TIMEOUT_CEILING_SECS", 120)?;
        if default_timeout_secs == 0 || default_timeout_secs > ceiling_secs {
            return Err(CliError::Config(
                "HEARTH_REQUEST_TIMEOUT_SECS must be positive and at most the ceiling".into(),
            ));
        }

        let breaker_rate: f64 = parse("HEARTH_BREAKER_RATE", 0.5)?;
        if !(0.0..=1.0).contains(&breaker_rate) {
            return Err(CliError::Config(
                "HEARTH_BREAKER_RATE must be between 0 and 1".into(),
            ));
        }

        Ok(Self {
            bind_addr,
            db_path: PathBuf::from(env_or("HEARTH_DB_PATH", "hearth.db")),
            log_dir: PathBuf::from(env_or("HEARTH_LOG_DIR", "logs")),
            log_archives: parse("HEARTH_LOG_ARCHIVES", 14)?,
            retention_days: parse("HEARTH_RETENTION_DAYS", 30)?,
            jwt_issuer: env_or("HEARTH_JWT_ISSUER", "hearth-bridge"),
            jwt_ttl_secs,
            refresh_ttl_secs,
            seed_admin: env_flag("HEARTH_SEED_ADMIN", true),
            forbid_loopback: env_flag("HEARTH_FORBID_LOOPBACK", false),
            queue_config: QueueConfig {
                capacity: parse("HEARTH_QUEUE_CAPACITY", 64)?,
                max_inflight_per_user: parse("HEARTH_MAX_INFLIGHT_PER_USER", 8)?,
            },
            pool_config: PoolConfig {
                min_sessions: pool_min,
                target_sessions: pool_target,
                max_sessions: pool_max,
                idle_timeout: Duration::from_secs(parse("HEARTH_POOL_IDLE_SECS", 300)?),
                upstream_timeout: Duration::from_secs(parse("HEARTH_UPSTREAM_TIMEOUT_SECS", 30)?),
                ..PoolConfig::default()
            },
            breaker_config: BreakerConfig {
                failure_threshold: parse("HEARTH_BREAKER_FAILURES", 5)?,
                failure_rate_threshold: breaker_rate,
                recovery_timeout: Duration::from_secs(parse("HEARTH_BREAKER_RECOVERY_SECS", 30)?),
                ..BreakerConfig::default()
            },
            cache_capacity: parse("HEARTH_CACHE_CAPACITY", 1024)?,
            cache_default_ttl: Duration::from_secs(parse("HEARTH_CACHE_TTL_SECS", 30)?),
            bridge_config: BridgeConfig {
                default_timeout: Duration::from_secs(default_timeout_secs),
                timeout_ceiling: Duration::from_secs(ceiling_secs),
                ..BridgeConfig::default()
            },
            shutdown_grace: Duration::from_secs(parse("HEARTH_SHUTDOWN_GRACE_SECS", 10)?),
        })
    }
}
