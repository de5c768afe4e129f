//! Semantic validation for parsed pipeline configuration values.
//!
//! Graph structure (unknown steps, cycles, wiring) is checked when the
//! pipeline is built; this pass catches the problems visible in the file
//! alone and reports all of them at once.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::PipelineConfig;

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.steps.is_empty() {
        errors.push("Pipeline must define at least one step".to_string());
    }

    let settings = &config.settings;
    if settings.channel_capacity == 0 {
        errors.push("settings.channel_capacity must be at least 1".to_string());
    }
    if settings.poll_interval_ms == 0 {
        errors.push("settings.poll_interval_ms must be at least 1".to_string());
    }
    if settings.logic_cache_size == 0 {
        errors.push("settings.logic_cache_size must be at least 1".to_string());
    }

    let mut seen = HashSet::new();
    for (i, step) in config.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            errors.push(format!("Step {i} has an empty name"));
        } else if !seen.insert(step.name.as_str()) {
            errors.push(format!("Step name '{}' is used more than once", step.name));
        }
        if step.use_ref.trim().is_empty() {
            errors.push(format!("Step '{}' has an empty step type (use)", step.name));
        }
        if step.copies == 0 {
            errors.push(format!("Step '{}' copies must be at least 1", step.name));
        }
    }

    for (i, hop) in config.hops.iter().enumerate() {
        if hop.from.trim().is_empty() || hop.to.trim().is_empty() {
            errors.push(format!("Hop {i} must name both 'from' and 'to' steps"));
        }
        if let Some(schema) = &hop.schema {
            if schema.iter().any(|f| f.name.trim().is_empty()) {
                errors.push(format!(
                    "Hop '{}' -> '{}' declares a field with an empty name",
                    hop.from, hop.to
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}
