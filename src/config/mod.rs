use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::messaging::connection::{
    ConnectionConfig, Credentials, DEFAULT_MAX_ATTEMPTS, DEFAULT_PORT, DEFAULT_RETRY_DELAY,
    DEFAULT_VHOST, RetryPolicy,
};

pub const DEFAULT_METRICS_PORT: u16 = 9090;

#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub retry: RetryPolicy,
    pub prefetch_count: u16,
    pub queue_name: String,
    pub service_name: String,
    pub metrics_port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::MissingRequired(key));

        let host = required("RABBITMQ_HOST")?;
        let username = required("RABBITMQ_USERNAME")?;
        let password = required("RABBITMQ_PASSWORD")?;
        let port = parse_or(&lookup, "RABBITMQ_PORT", DEFAULT_PORT)?;
        let vhost = lookup("RABBITMQ_VHOST").unwrap_or_else(|| DEFAULT_VHOST.to_string());
        let heartbeat = parse_optional::<u16, _>(&lookup, "RABBITMQ_HEARTBEAT")?;

        let max_attempts = parse_or(&lookup, "RABBITMQ_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "RABBITMQ_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let retry_delay_secs = parse_or(
            &lookup,
            "RABBITMQ_RETRY_DELAY_SECS",
            DEFAULT_RETRY_DELAY.as_secs(),
        )?;

        let prefetch_count: u16 = parse_required(&lookup, "PREFETCH_COUNT")?;
        if prefetch_count == 0 {
            return Err(ConfigError::Invalid {
                var: "PREFETCH_COUNT",
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let queue_name = required("QUEUE_NAME")?;
        let service_name = required("SERVICE_NAME")?;
        let metrics_port = parse_or(&lookup, "METRICS_PORT", DEFAULT_METRICS_PORT)?;
        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            connection: ConnectionConfig::new(host, port, Credentials::new(username, password))
                .with_vhost(vhost)
                .with_heartbeat(heartbeat),
            retry: RetryPolicy::new(max_attempts, Duration::from_secs(retry_delay_secs)),
            prefetch_count,
            queue_name,
            service_name,
            metrics_port,
            rust_log,
        })
    }
}

fn parse_optional<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
    }
}

fn parse_or<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_optional(lookup, var)?.unwrap_or(default))
}

fn parse_required<T, F>(lookup: &F, var: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    parse_optional(lookup, var)?.ok_or(ConfigError::MissingRequired(var))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const MINIMAL: &[(&str, &str)] = &[
        ("RABBITMQ_HOST", "localhost"),
        ("RABBITMQ_USERNAME", "guest"),
        ("RABBITMQ_PASSWORD", "guest"),
        ("PREFETCH_COUNT", "10"),
        ("QUEUE_NAME", "jobs"),
        ("SERVICE_NAME", "worker"),
    ];

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_lookup(lookup(MINIMAL)).unwrap();

        assert_eq!(config.connection.host(), "localhost");
        assert_eq!(config.connection.port(), 5672);
        assert_eq!(config.connection.vhost(), "/");
        assert_eq!(config.connection.heartbeat(), None);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.rust_log, "info");
    }

    #[test]
    fn test_overrides_parsed() {
        let mut pairs = MINIMAL.to_vec();
        pairs.extend([
            ("RABBITMQ_PORT", "5673"),
            ("RABBITMQ_HEARTBEAT", "0"),
            ("RABBITMQ_MAX_ATTEMPTS", "2"),
            ("RABBITMQ_RETRY_DELAY_SECS", "1"),
        ]);

        let config = Config::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.connection.port(), 5673);
        assert_eq!(config.connection.heartbeat(), Some(0));
        assert_eq!(config.retry.max_attempts(), 2);
        assert_eq!(config.retry.retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_missing_prefetch_is_reported() {
        let pairs: Vec<_> = MINIMAL
            .iter()
            .copied()
            .filter(|(k, _)| *k != "PREFETCH_COUNT")
            .collect();

        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();

        assert!(matches!(err, ConfigError::MissingRequired("PREFETCH_COUNT")));
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("RABBITMQ_PORT", "not-a-port"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "RABBITMQ_PORT", .. }));

        let mut pairs = MINIMAL.to_vec();
        pairs.retain(|(k, _)| *k != "PREFETCH_COUNT");
        pairs.push(("PREFETCH_COUNT", "0"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PREFETCH_COUNT", .. }));
    }
}
