use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: String,
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub auth_clock_skew: Duration,
    pub max_changes_per_batch: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("max_changes_per_batch", &self.max_changes_per_batch)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "TRAVELGRID_API_BIND_ADDR", "127.0.0.1:8080");
        let database_path = value_or_default(&lookup, "TRAVELGRID_DATABASE_PATH", "travelgrid.db");

        let jwt_secret = required_trimmed(&lookup, "AUTH_JWT_SECRET")?;
        if jwt_secret.len() < 16 {
            return Err(ConfigError::Invalid(
                "AUTH_JWT_SECRET must be at least 16 characters".to_string(),
            ));
        }
        let jwt_issuer = optional_trimmed(&lookup, "AUTH_JWT_ISSUER");
        let jwt_audience = optional_trimmed(&lookup, "AUTH_JWT_AUDIENCE");

        let auth_clock_skew_secs = value_or_default(&lookup, "AUTH_CLOCK_SKEW_SECS", "60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "AUTH_CLOCK_SKEW_SECS must be an integer in [0, 300]".to_string(),
                )
            })?;
        if auth_clock_skew_secs > 300 {
            return Err(ConfigError::Invalid(
                "AUTH_CLOCK_SKEW_SECS must be in [0, 300]".to_string(),
            ));
        }

        let max_changes_per_batch =
            value_or_default(&lookup, "SYNC_MAX_CHANGES_PER_BATCH", "500")
                .parse::<usize>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "SYNC_MAX_CHANGES_PER_BATCH must be an integer in [1, 5000]".to_string(),
                    )
                })?;
        if !(1..=5_000).contains(&max_changes_per_batch) {
            return Err(ConfigError::Invalid(
                "SYNC_MAX_CHANGES_PER_BATCH must be in [1, 5000]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            database_path,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            max_changes_per_batch,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_jwt_secret() {
        let map: HashMap<&str, &str> = HashMap::new();
        let err = config_from(&map).unwrap_err();
        assert!(err.to_string().contains("AUTH_JWT_SECRET"));
    }

    #[test]
    fn config_applies_defaults() {
        let map = HashMap::from([("AUTH_JWT_SECRET", "0123456789abcdef-secret")]);
        let config = config_from(&map).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.database_path, "travelgrid.db");
        assert_eq!(config.auth_clock_skew, Duration::from_secs(60));
        assert_eq!(config.max_changes_per_batch, 500);
        assert_eq!(config.jwt_issuer, None);
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let map = HashMap::from([
            ("AUTH_JWT_SECRET", "0123456789abcdef-secret"),
            ("SYNC_MAX_CHANGES_PER_BATCH", "0"),
        ]);
        assert!(config_from(&map)
            .unwrap_err()
            .to_string()
            .contains("SYNC_MAX_CHANGES_PER_BATCH"));

        let map = HashMap::from([
            ("AUTH_JWT_SECRET", "0123456789abcdef-secret"),
            ("AUTH_CLOCK_SKEW_SECS", "301"),
        ]);
        assert!(config_from(&map).is_err());
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let map = HashMap::from([
            ("AUTH_JWT_SECRET", "sensitive-signing-secret"),
            ("AUTH_JWT_ISSUER", "https://auth.travelgrid.test"),
        ]);
        let config = config_from(&map).unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-signing-secret"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(debug_output.contains("https://auth.travelgrid.test"));
    }
}
