pub mod check;
pub mod run;
pub mod steps;

use std::path::Path;

use anyhow::{Context, Result};
use rowflow_engine::config::types::PipelineConfig;
use rowflow_engine::config::{parser, validator};

/// Parse and validate a pipeline file.
pub fn load_pipeline(pipeline_path: &Path) -> Result<PipelineConfig> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    validator::validate_pipeline(&config)?;
    Ok(config)
}
