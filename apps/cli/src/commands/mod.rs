//! Command implementations for the `kiln` binary.

pub mod checkpoints;
pub mod metrics;
pub mod runs;
pub mod train;

use std::path::Path;

use anyhow::{Context, Result};
use kiln_core::DataLayout;
use kiln_stream::BroadcasterConfig;
use kiln_trainer::TrainingManager;

use crate::config::CliConfig;

/// Open the manager over the resolved data directory, applying any
/// `[stream]` tuning from the config file.
pub fn open_manager(data_dir: &Path, config: &CliConfig) -> Result<TrainingManager> {
    let mut manager = TrainingManager::open(DataLayout::new(data_dir))
        .with_context(|| format!("Failed to open data directory: {}", data_dir.display()))?;
    if let Some(queue_capacity) = config.stream.queue_capacity {
        manager = manager.with_broadcaster_config(BroadcasterConfig { queue_capacity });
    }
    Ok(manager)
}
