use std::path::Path;

use anyhow::Result;
use rowflow_engine::orchestrator;

/// Execute the `check` command: parse, validate, and build a pipeline.
pub fn execute(pipeline_path: &Path) -> Result<()> {
    let config = super::load_pipeline(pipeline_path)?;
    println!("Pipeline structure: OK");

    let result = orchestrator::check_pipeline(&config)?;
    println!("{result}");
    println!("\nAll checks passed.");
    Ok(())
}
