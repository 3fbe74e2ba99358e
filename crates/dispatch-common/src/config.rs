//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > dispatch.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call dispatch_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration value without touching the global slot.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("call.ring_timeout_secs", 45)?
        .set_default("call.retired_session_capacity", 64)?
        .set_default("call.event_capacity", 256)?
        .set_default("call.auto_reject_when_busy", true)?
        .set_default("log.filter", "dispatch=debug")?
        // Optional config file
        .add_source(config::File::with_name("dispatch").required(false))
        // Environment variables (DISPATCH__CALL__RING_TIMEOUT_SECS, etc.)
        .add_source(
            config::Environment::with_prefix("DISPATCH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub call: CallSettings,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallSettings {
    /// How long a call may stay Dialing or Ringing before it is failed locally.
    pub ring_timeout_secs: u64,
    /// How many terminated session ids are remembered to drop late duplicates.
    pub retired_session_capacity: usize,
    /// Buffer size of the UI notification channel.
    pub event_capacity: usize,
    /// Reject a second incoming call with reason `busy` instead of ignoring it.
    pub auto_reject_when_busy: bool,
}

impl CallSettings {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Fallback `tracing` filter when `RUST_LOG` is unset.
    pub filter: String,
}
