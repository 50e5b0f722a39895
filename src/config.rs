//! Scheduler configuration.
//!
//! Layered: built-in defaults, then an optional TOML file (path from
//! `CADENCE_CONFIG_PATH`, falling back to `cadence.toml` in the working
//! directory), then `CADENCE_*` environment overrides.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::budget::DEFAULT_MAX_CHECK_INTERVAL;

/// Default heap arena size per context.
pub const DEFAULT_ARENA_BYTES: usize = 256 * 1024;

/// Default native stack allowance below the load baseline.
pub const DEFAULT_STACK_RESERVE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bytes of private heap arena allocated per context.
    pub arena_bytes: usize,

    /// Ceiling on the number of steps between budget threshold checks;
    /// bounds how far a limit can be overshot.
    pub max_check_interval: u64,

    /// Native stack a context's guest code may consume below the baseline
    /// recorded at load time.
    pub stack_reserve_bytes: usize,

    /// Default budget limits applied by hosts that do not set their own
    /// (0 = unlimited).
    pub default_hard_limit: u64,
    pub default_soft_limit: u64,
    pub default_safe_limit: u64,

    /// Log filter installed by the init layer when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arena_bytes: DEFAULT_ARENA_BYTES,
            max_check_interval: DEFAULT_MAX_CHECK_INTERVAL,
            stack_reserve_bytes: DEFAULT_STACK_RESERVE_BYTES,
            default_hard_limit: 0,
            default_soft_limit: 0,
            default_safe_limit: 0,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, file, and environment.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        builder = match std::env::var("CADENCE_CONFIG_PATH") {
            Ok(path) => builder.add_source(config::File::with_name(&path)),
            Err(_) => builder.add_source(config::File::with_name("cadence").required(false)),
        };

        builder = builder.add_source(
            config::Environment::with_prefix("CADENCE").try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to assemble configuration sources")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.arena_bytes > 0, "arena_bytes must be positive");
        anyhow::ensure!(
            self.max_check_interval > 0,
            "max_check_interval must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.arena_bytes, DEFAULT_ARENA_BYTES);
        assert_eq!(config.default_hard_limit, 0);
    }

    #[test]
    fn toml_round_trip() {
        let config = Config {
            arena_bytes: 8192,
            default_hard_limit: 500,
            ..Config::default()
        };
        let rendered = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let parsed: Config = toml::from_str("arena_bytes = 1024\n").unwrap();
        assert_eq!(parsed.arena_bytes, 1024);
        assert_eq!(parsed.max_check_interval, DEFAULT_MAX_CHECK_INTERVAL);
    }

    #[test]
    fn zero_arena_is_rejected() {
        let config = Config {
            arena_bytes: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
