//! Command implementations for the thred CLI.

pub mod progress;
pub mod status;
pub mod train;

use anyhow::{Context, Result};
use std::path::Path;
use thred_training::{ModelLayout, RunConfig};

/// Loads the run persisted in `model_dir`.
pub fn load_run(model_dir: &Path) -> Result<RunConfig> {
    let path = ModelLayout::new(model_dir.to_path_buf()).config_path();
    let mut config = RunConfig::load(&path)
        .with_context(|| format!("No run found at {}", path.display()))?;
    // The directory may have moved since the run was saved.
    config.model_dir = model_dir.to_path_buf();
    Ok(config)
}

/// JSON scalars cannot be infinite.
pub fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}
