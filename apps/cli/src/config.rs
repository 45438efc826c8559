//! CLI configuration loading.
//!
//! `kiln.toml` carries defaults for the train command and tuning for the
//! push stream. Flags always win over the file; the file wins over the
//! built-in defaults.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Parsed `kiln.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub train: TrainDefaults,
    pub stream: StreamSettings,
}

/// `[train]` section: defaults applied when the train command's flags
/// are omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrainDefaults {
    pub model: Option<String>,
    pub epochs: Option<u32>,
    pub steps: Option<u32>,
    pub batch_size: Option<u32>,
    pub learning_rate: Option<f64>,
    pub save_every: Option<u32>,
}

/// `[stream]` section: subscriber queue bound and heartbeat cadence.
/// A heartbeat of 0 disables it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub queue_capacity: Option<usize>,
    pub heartbeat_secs: Option<u64>,
}

/// Load configuration. An explicitly passed path must exist; otherwise
/// `./kiln.toml` is used when present and defaults apply when not.
pub fn load(path: Option<&Path>) -> Result<CliConfig> {
    let candidate = match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("config file not found: {}", path.display());
            }
            path.to_path_buf()
        }
        None => {
            let default = Path::new("kiln.toml");
            if !default.exists() {
                return Ok(CliConfig::default());
            }
            default.to_path_buf()
        }
    };

    let raw = std::fs::read_to_string(&candidate)
        .with_context(|| format!("Failed to read config file: {}", candidate.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file: {}", candidate.display()))
}
