//! Layered daemon configuration.
//!
//! Sources, highest priority first:
//! 1. Environment variables prefixed `SCHOOLD_`, `__` separating sections
//!    (`SCHOOLD_CACHE__TTL_SECS=60` -> `cache.ttl_secs`)
//! 2. The TOML file named by `SCHOOLD_CONFIG_FILE`, or `schoold.toml` in the
//!    working directory
//! 3. Built-in defaults

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "SCHOOLD_";
pub const CONFIG_FILE_ENV: &str = "SCHOOLD_CONFIG_FILE";
pub const DEFAULT_CONFIG_FILE: &str = "schoold.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] figment::Error),

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Workspace folder opened at startup; clients may still switch with
    /// `workspace.select`.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub grades: GradesConfig,
    #[serde(default)]
    pub log: LogConfig,
}

const fn default_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GradesConfig {
    #[serde(default)]
    pub input_period: InputPeriod,
}

/// Window during which teachers submit grades, echoed to clients.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InputPeriod {
    pub start: String,
    pub end: String,
}

impl Default for InputPeriod {
    fn default() -> Self {
        Self {
            start: "2025-05-01".to_string(),
            end: "2025-06-16".to_string(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Fallback filter when `SCHOOLD_LOG_FILTER` is unset.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment() -> Figment {
        let file = std::env::var(CONFIG_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("grades.input_period.start", &self.grades.input_period.start),
            ("grades.input_period.end", &self.grades.input_period.end),
        ] {
            if chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_err() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("expected YYYY-MM-DD, got {value:?}"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_files_or_env() {
        Jail::expect_with(|_jail| {
            let config: Config = Config::figment().extract()?;
            assert_eq!(config.cache.ttl_secs, 300);
            assert_eq!(config.cache.ttl(), Duration::from_secs(300));
            assert_eq!(config.grades.input_period, InputPeriod::default());
            assert_eq!(config.log.level, "info");
            assert!(config.workspace.is_none());
            Ok(())
        });
    }

    #[test]
    fn toml_file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                workspace = "/srv/school"

                [cache]
                ttl_secs = 120

                [grades.input_period]
                start = "2026-03-02"
                end = "2026-04-10"
                "#,
            )?;
            jail.set_env("SCHOOLD_CACHE__TTL_SECS", "30");

            let config: Config = Config::figment().extract()?;
            assert_eq!(config.workspace, Some(PathBuf::from("/srv/school")));
            assert_eq!(config.cache.ttl_secs, 30);
            assert_eq!(config.grades.input_period.start, "2026-03-02");
            Ok(())
        });
    }

    #[test]
    fn malformed_input_period_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("SCHOOLD_GRADES__INPUT_PERIOD__START", "May 1st");
            let err = Config::load().expect_err("invalid date");
            assert!(matches!(err, ConfigError::InvalidValue { .. }));
            Ok(())
        });
    }
}
