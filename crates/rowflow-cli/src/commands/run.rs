use std::path::Path;

use anyhow::{Context, Result};
use rowflow_engine::PipelineBuilder;

/// Execute the `run` command: parse, validate, build, and run a pipeline.
pub async fn execute(pipeline_path: &Path, parallelism: &[String]) -> Result<()> {
    let config = super::load_pipeline(pipeline_path)?;

    tracing::info!(
        pipeline = config.pipeline,
        steps = config.steps.len(),
        hops = config.hops.len(),
        "Pipeline validated"
    );

    let mut builder = PipelineBuilder::new(config.to_graph()).settings(config.settings.clone());
    for spec in parallelism {
        let (step, copies) = parse_parallelism(spec)?;
        builder = builder.parallelism(step, copies);
    }
    let mut pipeline = builder.build()?;
    pipeline.start()?;

    let result = tokio::select! {
        result = pipeline.wait_until_finished() => result?,
        _ = tokio::signal::ctrl_c() => {
            pipeline.stop_all("interrupted");
            pipeline.wait_until_finished().await?
        }
    };

    println!("{result}");

    // Machine-readable JSON for scripting
    let json = serde_json::json!({
        "pipeline": result.pipeline,
        "success": result.success,
        "stopped": result.stopped,
        "rows_read": result.rows_read,
        "rows_written": result.rows_written,
        "rows_rejected": result.rows_rejected,
        "rows_discarded": result.rows_discarded,
        "error_count": result.error_count,
        "duration_secs": result.duration_secs,
    });
    println!("@@RESULT_JSON@@{json}");

    if !result.success {
        let failed: Vec<String> = result.failures().map(|s| s.label()).collect();
        if failed.is_empty() {
            anyhow::bail!(
                "Pipeline '{}' finished with {} row error(s)",
                result.pipeline,
                result.error_count
            );
        }
        anyhow::bail!("Pipeline '{}' failed in {}", result.pipeline, failed.join(", "));
    }
    Ok(())
}

fn parse_parallelism(spec: &str) -> Result<(&str, usize)> {
    let (step, copies) = spec
        .split_once('=')
        .with_context(|| format!("Invalid parallelism '{spec}', expected STEP=COPIES"))?;
    let copies: usize = copies
        .trim()
        .parse()
        .with_context(|| format!("Invalid copy count in '{spec}'"))?;
    if copies == 0 {
        anyhow::bail!("Invalid parallelism '{spec}': copies must be at least 1");
    }
    Ok((step.trim(), copies))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parallelism() {
        assert_eq!(parse_parallelism("work=3").unwrap(), ("work", 3));
        assert_eq!(parse_parallelism(" work = 2 ").unwrap(), ("work", 2));
        assert!(parse_parallelism("work").is_err());
        assert!(parse_parallelism("work=none").is_err());
        assert!(parse_parallelism("work=0").is_err());
    }
}
