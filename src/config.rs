//! Configuration loading and schema definitions for testfarm.
//!
//! This module provides types and functions for loading testfarm
//! configuration from TOML files or strings, plus the [`LiveConfig`] handle
//! through which the scheduler reads settings at runtime.

pub mod live;
pub mod schema;

pub use live::LiveConfig;
pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads testfarm configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use testfarm::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testfarm.toml"))?;
/// println!("Max tests per node: {}", config.farm.max_tests_per_node);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads testfarm configuration from a TOML string.
///
/// # Example
///
/// ```
/// use testfarm::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [farm]
///     max_retries = 5
///
///     [[nodes]]
///     address = "localhost:7000"
/// "#)?;
///
/// assert_eq!(config.farm.max_retries, 5);
/// assert_eq!(config.nodes.len(), 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
