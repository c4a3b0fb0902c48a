use std::path::PathBuf;

use anyhow::{Context, Result};
use config::Config;
use serde::Deserialize;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Runtime settings: built-in defaults, overridden by `LEGAL_*` env vars.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_path: PathBuf,
    /// Pause before every listing page request.
    pub page_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    /// Stored error text is cut to this many characters.
    pub error_log_chars: usize,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::from_config(
            Config::builder().add_source(config::Environment::with_prefix("LEGAL")),
        )
    }

    fn from_config(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        builder
            .set_default("database_path", "data/legal.sqlite")?
            .set_default("page_delay_ms", 2000)?
            .set_default("request_timeout_secs", 30)?
            .set_default("user_agent", DEFAULT_USER_AGENT)?
            .set_default("error_log_chars", 500)?
            .build()
            .context("Failed to build settings")?
            .try_deserialize()
            .context("Invalid settings")
    }
}
