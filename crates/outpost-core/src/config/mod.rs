//! Sync tunables shared by the server and client nodes.
//!
//! Values come from `OUTPOST_*` environment variables; every one has a default
//! and an accepted range.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::ConflictResolution;
use crate::util::normalize_text_option;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_PACKET_BYTES: usize = 16 * 1024 * 1024;

/// Runtime settings for change batching, retries, scheduling and conflicts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Maximum entries per packet
    pub batch_size: usize,
    /// Transmission attempts per packet and cycle
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    pub sync_interval: Duration,
    pub conflict_strategy: ConflictResolution,
    /// Archive losing versions to the version history
    pub versioning: bool,
    /// Exchanges per cycle before yielding to the next tick
    pub max_rounds: u32,
    /// Decompressed packet size limit
    pub max_packet_bytes: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: 5,
            request_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(30),
            sync_interval: Duration::from_secs(300),
            conflict_strategy: ConflictResolution::ServerWins,
            versioning: true,
            max_rounds: 50,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
        }
    }
}

impl SyncSettings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = std::env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let batch_size = ranged(&lookup, "OUTPOST_BATCH_SIZE", defaults.batch_size, 1, 10_000)?;
        let max_retries = ranged(&lookup, "OUTPOST_MAX_RETRIES", defaults.max_retries, 1, 50)?;
        let timeout_secs = ranged(&lookup, "OUTPOST_REQUEST_TIMEOUT_SECS", 30_u64, 1, 600)?;
        let backoff_ms = ranged(&lookup, "OUTPOST_RETRY_BACKOFF_MS", 500_u64, 10, 60_000)?;
        let backoff_max_ms =
            ranged(&lookup, "OUTPOST_RETRY_BACKOFF_MAX_MS", 30_000_u64, 10, 600_000)?;
        if backoff_max_ms < backoff_ms {
            return Err(Error::InvalidInput(
                "OUTPOST_RETRY_BACKOFF_MAX_MS must be >= OUTPOST_RETRY_BACKOFF_MS".to_string(),
            ));
        }
        let interval_secs = ranged(&lookup, "OUTPOST_SYNC_INTERVAL_SECS", 300_u64, 5, 86_400)?;
        let max_rounds = ranged(&lookup, "OUTPOST_MAX_ROUNDS", defaults.max_rounds, 1, 10_000)?;
        let max_packet_bytes = ranged(
            &lookup,
            "OUTPOST_MAX_PACKET_BYTES",
            defaults.max_packet_bytes,
            1024,
            1024 * 1024 * 1024,
        )?;

        let conflict_strategy = match normalize_text_option(lookup("OUTPOST_CONFLICT_STRATEGY")) {
            Some(raw) => raw.parse::<ConflictResolution>().map_err(|error| {
                Error::InvalidInput(format!(
                    "OUTPOST_CONFLICT_STRATEGY: {error} (expected server_wins, timestamp_wins or manual)"
                ))
            })?,
            None => defaults.conflict_strategy,
        };

        let versioning = match normalize_text_option(lookup("OUTPOST_VERSIONING")) {
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                Error::InvalidInput("OUTPOST_VERSIONING must be true or false".to_string())
            })?,
            None => defaults.versioning,
        };

        Ok(Self {
            batch_size,
            max_retries,
            request_timeout: Duration::from_secs(timeout_secs),
            retry_backoff: Duration::from_millis(backoff_ms),
            retry_backoff_max: Duration::from_millis(backoff_max_ms),
            sync_interval: Duration::from_secs(interval_secs),
            conflict_strategy,
            versioning,
            max_rounds,
            max_packet_bytes,
        })
    }
}

fn ranged<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    min: T,
    max: T,
) -> Result<T>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let Some(raw) = normalize_text_option(lookup(name)) else {
        return Ok(default);
    };
    let value = raw.parse::<T>().map_err(|_| {
        Error::InvalidInput(format!("{name} must be an integer in [{min}, {max}]"))
    })?;
    if value < min || value > max {
        return Err(Error::InvalidInput(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_from(pairs: &[(&str, &str)]) -> Result<SyncSettings> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        SyncSettings::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = settings_from(&[]).unwrap();
        assert_eq!(settings, SyncSettings::default());
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.conflict_strategy, ConflictResolution::ServerWins);
        assert!(settings.versioning);
    }

    #[test]
    fn parses_overrides() {
        let settings = settings_from(&[
            ("OUTPOST_BATCH_SIZE", "25"),
            ("OUTPOST_CONFLICT_STRATEGY", "timestamp_wins"),
            ("OUTPOST_VERSIONING", "off"),
            ("OUTPOST_SYNC_INTERVAL_SECS", " 60 "),
        ])
        .unwrap();
        assert_eq!(settings.batch_size, 25);
        assert_eq!(settings.conflict_strategy, ConflictResolution::TimestampWins);
        assert!(!settings.versioning);
        assert_eq!(settings.sync_interval, Duration::from_secs(60));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = settings_from(&[("OUTPOST_BATCH_SIZE", "0")]).unwrap_err();
        assert!(err.to_string().contains("OUTPOST_BATCH_SIZE"));

        let err = settings_from(&[("OUTPOST_MAX_RETRIES", "many")]).unwrap_err();
        assert!(err.to_string().contains("OUTPOST_MAX_RETRIES"));
    }

    #[test]
    fn rejects_unknown_strategy() {
        let err = settings_from(&[("OUTPOST_CONFLICT_STRATEGY", "client_wins")]).unwrap_err();
        assert!(err.to_string().contains("OUTPOST_CONFLICT_STRATEGY"));
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let err = settings_from(&[
            ("OUTPOST_RETRY_BACKOFF_MS", "5000"),
            ("OUTPOST_RETRY_BACKOFF_MAX_MS", "1000"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("BACKOFF_MAX"));
    }
}
