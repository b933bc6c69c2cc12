// src/config.rs

//! Configuration loading at process start.
//!
//! A bad configuration is the one fatal error class, so everything here either returns a
//! validated `Config` or an error the caller should exit on.

use std::path::Path;

use crate::error::{AppError, Result};
use crate::models::Config;

/// Load configuration from a TOML file, then layer environment credentials on top.
///
/// A missing file falls back to defaults; a file that exists but does not parse is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        log::info!("Loading configuration from {}", path.display());
        Config::load(path)
            .map_err(|e| AppError::config(format!("Failed to load {}: {e}", path.display())))?
    } else {
        log::warn!("No config file at {}; using defaults", path.display());
        Config::default()
    };
    config.apply_env();
    Ok(config)
}

/// Load and validate.
pub fn load_validated(path: &Path) -> Result<Config> {
    let config = load_config(path)?;
    config.validate()?;
    log::debug!(
        "Configuration OK: {} credentials, region {}",
        config.credentials.len(),
        config.api.region
    );
    Ok(config)
}
