use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use outpost_core::sync::MIN_SECRET_LEN;
use outpost_core::SyncSettings;
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
    pub db_path: PathBuf,
    pub schema_path: PathBuf,
    pub token_secret: String,
    pub token_ttl: Duration,
    pub server_code: String,
    pub server_name: String,
    pub rate_limit_window: Duration,
    pub register_rate_limit_per_window: u32,
    pub exchange_rate_limit_per_window: u32,
    pub sync: SyncSettings,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("schema_path", &self.schema_path)
            .field("token_secret", &"[REDACTED]")
            .field("token_ttl", &self.token_ttl)
            .field("server_code", &self.server_code)
            .field("server_name", &self.server_name)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "register_rate_limit_per_window",
                &self.register_rate_limit_per_window,
            )
            .field(
                "exchange_rate_limit_per_window",
                &self.exchange_rate_limit_per_window,
            )
            .field("sync", &self.sync)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "OUTPOST_BIND_ADDR", "127.0.0.1:8080");
        let db_path = PathBuf::from(value_or_default(
            &lookup,
            "OUTPOST_DB_PATH",
            "outpost-server.db",
        ));
        let schema_path = PathBuf::from(required_trimmed(&lookup, "OUTPOST_SCHEMA_PATH")?);

        let token_secret = required_trimmed(&lookup, "OUTPOST_TOKEN_SECRET")?;
        if token_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "OUTPOST_TOKEN_SECRET must be at least {MIN_SECRET_LEN} characters"
            )));
        }

        let token_ttl_days = value_or_default(&lookup, "OUTPOST_TOKEN_TTL_DAYS", "3650")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "OUTPOST_TOKEN_TTL_DAYS must be an integer in [1, 36500]".to_string(),
                )
            })?;
        if !(1..=36_500).contains(&token_ttl_days) {
            return Err(ConfigError::Invalid(
                "OUTPOST_TOKEN_TTL_DAYS must be in [1, 36500]".to_string(),
            ));
        }

        let server_code = value_or_default(&lookup, "OUTPOST_SERVER_CODE", "hq");
        let server_name = value_or_default(&lookup, "OUTPOST_SERVER_NAME", "Outpost server");

        let rate_limit_window_secs = value_or_default(&lookup, "RATE_LIMIT_WINDOW_SECS", "60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "RATE_LIMIT_WINDOW_SECS must be an integer in [10, 3600]".to_string(),
                )
            })?;
        if !(10..=3_600).contains(&rate_limit_window_secs) {
            return Err(ConfigError::Invalid(
                "RATE_LIMIT_WINDOW_SECS must be in [10, 3600]".to_string(),
            ));
        }

        let register_rate_limit_per_window =
            value_or_default(&lookup, "REGISTER_RATE_LIMIT_PER_WINDOW", "10")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "REGISTER_RATE_LIMIT_PER_WINDOW must be an integer in [1, 1000]"
                            .to_string(),
                    )
                })?;
        if !(1..=1_000).contains(&register_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "REGISTER_RATE_LIMIT_PER_WINDOW must be in [1, 1000]".to_string(),
            ));
        }

        let exchange_rate_limit_per_window =
            value_or_default(&lookup, "EXCHANGE_RATE_LIMIT_PER_WINDOW", "600")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "EXCHANGE_RATE_LIMIT_PER_WINDOW must be an integer in [1, 100000]"
                            .to_string(),
                    )
                })?;
        if !(1..=100_000).contains(&exchange_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "EXCHANGE_RATE_LIMIT_PER_WINDOW must be in [1, 100000]".to_string(),
            ));
        }

        let sync = SyncSettings::from_lookup(&lookup)
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;

        Ok(Self {
            bind_addr,
            db_path,
            schema_path,
            token_secret,
            token_ttl: Duration::from_secs(token_ttl_days * 24 * 60 * 60),
            server_code,
            server_name,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            register_rate_limit_per_window,
            exchange_rate_limit_per_window,
            sync,
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
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        db_path: PathBuf::from(":memory:"),
        schema_path: PathBuf::from("schema.json"),
        token_secret: "route-test-secret-0123456789abcdef".to_string(),
        token_ttl: Duration::from_secs(3600),
        server_code: "hq".to_string(),
        server_name: "Head office".to_string(),
        rate_limit_window: Duration::from_secs(60),
        register_rate_limit_per_window: 3,
        exchange_rate_limit_per_window: 100,
        sync: SyncSettings::default(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    fn minimal() -> HashMap<&'static str, &'static str> {
        let mut map = HashMap::new();
        map.insert("OUTPOST_SCHEMA_PATH", "/etc/outpost/schema.json");
        map.insert("OUTPOST_TOKEN_SECRET", "sensitive-token-secret-0123456789abcdef");
        map
    }

    #[test]
    fn config_requires_minimum_secrets() {
        let mut map = minimal();
        map.remove("OUTPOST_TOKEN_SECRET");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("OUTPOST_TOKEN_SECRET"));

        map.insert("OUTPOST_TOKEN_SECRET", "short");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("at least 32"));
    }

    #[test]
    fn config_applies_defaults() {
        let config = load(&minimal()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.server_code, "hq");
        assert_eq!(config.token_ttl, Duration::from_secs(3650 * 24 * 60 * 60));
        assert_eq!(config.sync, SyncSettings::default());
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let mut map = minimal();
        map.insert("RATE_LIMIT_WINDOW_SECS", "5");
        assert!(load(&map).is_err());

        let mut map = minimal();
        map.insert("OUTPOST_CONFLICT_STRATEGY", "coin_flip");
        assert!(load(&map).is_err());
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let config = load(&minimal()).unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-token-secret"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
