//! Configuration loading

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `explicit` (the `--config` flag); must exist
/// 2. `HUDDLE_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (Kubernetes mount path)
/// 5. Fall back to environment variables only
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config_path = match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("config file {} does not exist", path.display());
            }
            Some(path.to_path_buf())
        }
        None => find_config_file(),
    };

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {}", path.display());
        Config::from_file(&path)
            .with_context(|| format!("failed to load {}", path.display()))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().context("failed to load configuration from environment")?
    };

    // Fail fast on misconfigurations
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!("Configuration loaded and validated successfully");
    Ok(config)
}

fn find_config_file() -> Option<PathBuf> {
    std::env::var_os("HUDDLE_CONFIG_PATH")
        .map(PathBuf::from)
        .filter(|p| p.exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
        })
}
