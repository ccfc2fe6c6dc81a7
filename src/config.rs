use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_ADMIN_CHANNEL: &str = "admins";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tuning knobs for the notification engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Events per actor that trigger a high-activity alert.
    #[serde(default = "default_activity_threshold")]
    pub activity_threshold: u32,
    /// Period of the global counter reset.
    #[serde(default = "default_reset_interval_ms")]
    pub reset_interval_ms: u64,
    /// Minimum batch size that is worth an aggregated notification.
    #[serde(default = "default_batch_min_threshold")]
    pub batch_min_threshold: u32,
    /// Hard window measured from the first event of a batch.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Quiet period after the last event of a batch.
    #[serde(default = "default_batch_debounce_ms")]
    pub batch_debounce_ms: u64,
    #[serde(default = "default_tenant_in_batch_key")]
    pub tenant_in_batch_key: bool,
    #[serde(default = "default_admin_channel")]
    pub admin_channel: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            activity_threshold: default_activity_threshold(),
            reset_interval_ms: default_reset_interval_ms(),
            batch_min_threshold: default_batch_min_threshold(),
            batch_window_ms: default_batch_window_ms(),
            batch_debounce_ms: default_batch_debounce_ms(),
            tenant_in_batch_key: default_tenant_in_batch_key(),
            admin_channel: default_admin_channel(),
        }
    }
}

fn default_activity_threshold() -> u32 {
    25
}

fn default_reset_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_batch_min_threshold() -> u32 {
    3
}

fn default_batch_window_ms() -> u64 {
    120_000
}

fn default_batch_debounce_ms() -> u64 {
    15_000
}

fn default_tenant_in_batch_key() -> bool {
    true
}

fn default_admin_channel() -> String {
    DEFAULT_ADMIN_CHANNEL.to_string()
}

impl NotifierConfig {
    /// Defaults overridden by `ACTIVITY_*` environment variables. A `.env`
    /// file in the working directory is loaded first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        override_parsed(&lookup, "ACTIVITY_THRESHOLD", &mut cfg.activity_threshold)?;
        override_parsed(&lookup, "ACTIVITY_RESET_INTERVAL_MS", &mut cfg.reset_interval_ms)?;
        override_parsed(&lookup, "ACTIVITY_BATCH_MIN", &mut cfg.batch_min_threshold)?;
        override_parsed(&lookup, "ACTIVITY_BATCH_WINDOW_MS", &mut cfg.batch_window_ms)?;
        override_parsed(&lookup, "ACTIVITY_BATCH_DEBOUNCE_MS", &mut cfg.batch_debounce_ms)?;

        if let Some(raw) = lookup("ACTIVITY_BATCH_TENANT_KEY") {
            cfg.tenant_in_batch_key = parse_flag(&raw).ok_or(ConfigError::InvalidValue {
                key: "ACTIVITY_BATCH_TENANT_KEY",
                value: raw,
            })?;
        }
        if let Some(raw) = lookup("ACTIVITY_ADMIN_CHANNEL") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                cfg.admin_channel = trimmed.to_string();
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.activity_threshold == 0 {
            return Err(ConfigError::Invalid("activity_threshold must be at least 1".into()));
        }
        if self.batch_min_threshold == 0 {
            return Err(ConfigError::Invalid("batch_min_threshold must be at least 1".into()));
        }
        if self.reset_interval_ms == 0 || self.batch_window_ms == 0 || self.batch_debounce_ms == 0 {
            return Err(ConfigError::Invalid("durations must be non-zero".into()));
        }
        if self.batch_debounce_ms >= self.batch_window_ms {
            return Err(ConfigError::Invalid(format!(
                "batch_debounce_ms ({}) must be shorter than batch_window_ms ({})",
                self.batch_debounce_ms, self.batch_window_ms
            )));
        }
        if self.admin_channel.trim().is_empty() {
            return Err(ConfigError::Invalid("admin_channel must not be empty".into()));
        }
        Ok(())
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_millis(self.reset_interval_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn batch_debounce(&self) -> Duration {
        Duration::from_millis(self.batch_debounce_ms)
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value: raw.clone() })?;
    Ok(())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = NotifierConfig::default();
        cfg.validate().unwrap();
        assert!(cfg.tenant_in_batch_key);
        assert_eq!(cfg.batch_debounce(), Duration::from_secs(15));
        assert_eq!(cfg.admin_channel, "admins");
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = NotifierConfig::from_lookup(lookup_from(&[
            ("ACTIVITY_THRESHOLD", "10"),
            ("ACTIVITY_BATCH_WINDOW_MS", " 60000 "),
            ("ACTIVITY_BATCH_TENANT_KEY", "off"),
            ("ACTIVITY_ADMIN_CHANNEL", "ops"),
        ]))
        .unwrap();
        assert_eq!(cfg.activity_threshold, 10);
        assert_eq!(cfg.batch_window_ms, 60_000);
        assert!(!cfg.tenant_in_batch_key);
        assert_eq!(cfg.admin_channel, "ops");
    }

    #[test]
    fn rejects_unparsable_and_inconsistent_values() {
        let err = NotifierConfig::from_lookup(lookup_from(&[("ACTIVITY_BATCH_MIN", "three")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "ACTIVITY_BATCH_MIN", .. }));

        let err = NotifierConfig::from_lookup(lookup_from(&[
            ("ACTIVITY_BATCH_DEBOUNCE_MS", "5000"),
            ("ACTIVITY_BATCH_WINDOW_MS", "5000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let cfg: NotifierConfig = serde_json::from_str(r#"{"batch_min_threshold": 5}"#).unwrap();
        assert_eq!(cfg.batch_min_threshold, 5);
        assert_eq!(cfg.activity_threshold, 25);
    }
}
