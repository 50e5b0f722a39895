//! Initialization system for Cadence
//!
//! Provides a centralized initialization API that embedding hosts should
//! call before using the rest of the crate. It loads configuration and
//! installs the tracing subscriber exactly once.
//!
//! # Example
//!
//! ```rust,no_run
//! use cadence_core::init::InitBuilder;
//!
//! // Simple initialization
//! InitBuilder::new().init()?;
//!
//! // Custom configuration
//! InitBuilder::new()
//!     .config_path("deploy/cadence.toml")
//!     .log_filter("cadence_core=debug")
//!     .init()?;
//! # anyhow::Ok(())
//! ```

use anyhow::{anyhow, Context as _, Result};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Global initialization state
static INIT_STATE: OnceLock<InitState> = OnceLock::new();

/// Initialization state
#[derive(Debug)]
struct InitState {
    config: Config,
}

/// Options for initializing Cadence
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Config file path (overrides default search)
    pub config_path: Option<String>,

    /// Log filter used when neither `RUST_LOG` nor the config file sets one
    pub log_filter: Option<String>,

    /// Whether to install the global tracing subscriber
    pub install_tracing: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            log_filter: None,
            install_tracing: true,
        }
    }
}

/// Builder for constructing InitOptions
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    /// Create a new builder with default options
    pub fn new() -> Self {
        Self {
            options: InitOptions::default(),
        }
    }

    /// Set the config file path
    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    /// Set the log filter
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.options.log_filter = Some(filter.into());
        self
    }

    /// Set whether to install the global tracing subscriber
    pub fn install_tracing(mut self, install: bool) -> Self {
        self.options.install_tracing = install;
        self
    }

    /// Initialize Cadence with the configured options
    pub fn init(self) -> Result<()> {
        initialize(self.options)
    }
}

impl Default for InitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize Cadence with the given options
///
/// This function should be called once at the start of your application,
/// before using any other Cadence functionality. It:
/// - Applies configuration overrides to environment variables
/// - Loads and validates configuration
/// - Installs the tracing subscriber (unless disabled)
/// - Sets up global state
///
/// Calling this function multiple times is safe - subsequent calls are no-ops.
pub fn initialize(options: InitOptions) -> Result<()> {
    // If already initialized, this is a no-op
    if INIT_STATE.get().is_some() {
        return Ok(());
    }

    // Apply options to environment variables so they're used by config loading
    if let Some(path) = &options.config_path {
        std::env::set_var("CADENCE_CONFIG_PATH", path);
    }

    // Load configuration (now with env vars set)
    let config = Config::load().context("Failed to load configuration")?;

    if options.install_tracing {
        let fallback = options
            .log_filter
            .clone()
            .unwrap_or_else(|| config.log_filter.clone());
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

        // A subscriber may already be installed (tests, embedding hosts);
        // that is not an initialization failure.
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    // Store initialization state
    let state = InitState { config };

    INIT_STATE
        .set(state)
        .map_err(|_| anyhow!("Initialization already completed"))?;

    Ok(())
}

/// Check if Cadence has been initialized
pub fn is_initialized() -> bool {
    INIT_STATE.get().is_some()
}

/// Get the current configuration (panics if not initialized)
pub fn get_config() -> &'static Config {
    &INIT_STATE
        .get()
        .expect("Cadence not initialized - call init() first")
        .config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_idempotent() {
        let result = InitBuilder::new().install_tracing(false).init();
        assert!(result.is_ok());
        assert!(is_initialized());

        // Second call is a no-op
        assert!(InitBuilder::new().install_tracing(false).init().is_ok());
        assert!(get_config().arena_bytes > 0);
    }
}
