use serde::Deserialize;
use std::env;

/// Top-level configuration container, assembled once in `main` via
/// [`Config::from_env`] and threaded through [`crate::AppState`].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub reservation: ReservationConfig,
    pub lock: LockConfig,
    pub queue: QueueConfig,
    pub sweeper: SweeperConfig,
    pub websocket: WebsocketConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
}

/// Assembled from DB_HOST, DB_PORT, DB_USER, DB_PASSWORD, DB_NAME (or
/// DATABASE_URL directly).
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

/// Assembled from REDIS_HOST, REDIS_PORT, REDIS_PASSWORD (or REDIS_URL
/// directly).
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Reservation-engine sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct ReservationConfig {
    pub timeout_seconds: i64,
    pub max_seats_per_booking: usize,
}

/// Distributed-lock sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    pub timeout_seconds: u64,
    pub max_wait_ms: u64,
    pub retry_interval_ms: u64,
}

/// Priority queue / worker sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub request_status_ttl_seconds: u64,
    pub pel_reclaim_idle_ms: u64,
    pub max_deliveries: u32,
}

/// Expiration sweeper sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    pub interval_seconds: u64,
    pub batch_size: i64,
}

/// WebSocket idle-connection policy (CONNECTION_IDLE_TIMEOUT).
#[derive(Debug, Clone, Deserialize)]
pub struct WebsocketConfig {
    pub idle_timeout_seconds: u64,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// A malformed or unparseable environment variable. `main` matches on this
/// distinctly from a startup failure so the process exits 2, not 1.
#[derive(Debug, thiserror::Error)]
#[error("{name} must be a valid value: {source}")]
pub struct ConfigError {
    name: &'static str,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var_or(name, default).parse().map_err(|e: T::Err| ConfigError {
        name,
        source: Box::new(e),
    })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // DATABASE_URL, if present, wins outright; otherwise assemble from
        // the discrete DB_HOST/DB_PORT/DB_USER/DB_PASSWORD/DB_NAME vars.
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "postgres://{}:{}@{}:{}/{}",
                var_or("DB_USER", "postgres"),
                var_or("DB_PASSWORD", "postgres"),
                var_or("DB_HOST", "localhost"),
                var_or("DB_PORT", "5432"),
                var_or("DB_NAME", "seatguard"),
            )
        });

        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| {
            let password = env::var("REDIS_PASSWORD").unwrap_or_default();
            let auth = if password.is_empty() {
                String::new()
            } else {
                format!(":{}@", password)
            };
            format!(
                "redis://{}{}:{}",
                auth,
                var_or("REDIS_HOST", "localhost"),
                var_or("REDIS_PORT", "6379"),
            )
        });

        Ok(Config {
            app: AppConfig {
                host: var_or("HOST", "0.0.0.0"),
                port: parse_var("PORT", "8000")?,
                environment: var_or("ENVIRONMENT", "development"),
                rust_log: var_or("RUST_LOG", "seatguard=debug,tower_http=debug"),
            },
            database: DatabaseConfig {
                url: database_url,
                pool_size: parse_var("DB_POOL_SIZE", "20")?,
            },
            redis: RedisConfig { url: redis_url },
            reservation: ReservationConfig {
                timeout_seconds: parse_var("RESERVATION_TIMEOUT_SECONDS", "600")?,
                max_seats_per_booking: parse_var("MAX_SEATS_PER_BOOKING", "10")?,
            },
            lock: LockConfig {
                timeout_seconds: parse_var("LOCK_TIMEOUT_SECONDS", "30")?,
                max_wait_ms: parse_var("LOCK_MAX_WAIT_MS", "5000")?,
                retry_interval_ms: parse_var("LOCK_RETRY_INTERVAL_MS", "50")?,
            },
            queue: QueueConfig {
                request_status_ttl_seconds: parse_var("REQUEST_STATUS_TTL", "3600")?,
                pel_reclaim_idle_ms: parse_var("PEL_RECLAIM_IDLE_MS", "60000")?,
                max_deliveries: parse_var("MAX_DELIVERIES", "3")?,
            },
            sweeper: SweeperConfig {
                interval_seconds: parse_var("SWEEPER_INTERVAL_SECONDS", "30")?,
                batch_size: parse_var("SWEEPER_BATCH_SIZE", "200")?,
            },
            websocket: WebsocketConfig {
                idle_timeout_seconds: parse_var("CONNECTION_IDLE_TIMEOUT", "120")?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_reports_the_offending_name_on_bad_input() {
        std::env::set_var("SEATGUARD_TEST_BAD_PORT", "not-a-number");
        let err = parse_var::<u16>("SEATGUARD_TEST_BAD_PORT", "8000").unwrap_err();
        assert!(err.to_string().contains("SEATGUARD_TEST_BAD_PORT"));
        std::env::remove_var("SEATGUARD_TEST_BAD_PORT");
    }

    #[test]
    fn parse_var_falls_back_to_default_when_unset() {
        std::env::remove_var("SEATGUARD_TEST_UNSET_PORT");
        let value = parse_var::<u16>("SEATGUARD_TEST_UNSET_PORT", "8000").unwrap();
        assert_eq!(value, 8000);
    }
}
