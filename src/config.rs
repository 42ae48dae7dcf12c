use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Upper bound accepted for `MAX_STAY_DAYS`.
pub const MAX_STAY_DAYS_LIMIT: i64 = 3650;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} should be set")]
    Missing(&'static str),

    #[error("{key} has an invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct AmqpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub payment_callback_queue: String,
    pub booking_events_exchange: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub memory_seed_file: Option<String>,
    pub retry: RetryPolicy,
    pub max_stay_days: i64,
    pub amqp: Option<AmqpSettings>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let database_url = lookup("DATABASE_URL");
        if backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let amqp = if parse_or(&lookup, "AMQP_ENABLED", true)? {
            Some(AmqpSettings {
                host: lookup("AMQP_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: parse_or(&lookup, "AMQP_PORT", 5672)?,
                username: lookup("AMQP_USER").unwrap_or_else(|| "guest".to_string()),
                password: lookup("AMQP_PASSWORD").unwrap_or_else(|| "guest".to_string()),
                payment_callback_queue: lookup("PAYMENT_CALLBACK_QUEUE")
                    .unwrap_or_else(|| "payment.callbacks".to_string()),
                booking_events_exchange: lookup("BOOKING_EVENTS_EXCHANGE")
                    .unwrap_or_else(|| "booking.events".to_string()),
            })
        } else {
            None
        };

        let max_stay_days: i64 = parse_or(&lookup, "MAX_STAY_DAYS", 30)?;
        if !(1..=MAX_STAY_DAYS_LIMIT).contains(&max_stay_days) {
            return Err(ConfigError::Invalid {
                key: "MAX_STAY_DAYS",
                value: max_stay_days.to_string(),
            });
        }

        Ok(Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&lookup, "PORT", 8080)?,
            backend,
            database_url,
            db_pool_size: parse_or(&lookup, "DB_POOL_SIZE", 10)?,
            memory_seed_file: lookup("MEMORY_SEED_FILE"),
            retry: RetryPolicy {
                max_attempts: parse_or(&lookup, "RESERVATION_MAX_ATTEMPTS", 3)?,
                base_delay: Duration::from_millis(parse_or(&lookup, "RESERVATION_RETRY_BASE_MS", 25)?),
            },
            max_stay_days,
            amqp,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
