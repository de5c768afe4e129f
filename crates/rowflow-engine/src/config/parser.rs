//! Pipeline YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PipelineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        std::env::var(var_name).unwrap_or_else(|_| {
            if !missing.iter().any(|m| m == var_name) {
                missing.push(var_name.to_string());
            }
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: PipelineConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")?;
    Ok(config)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("RF_TEST_LEVEL", "warn");
        let input = "level: ${RF_TEST_LEVEL}\nlimit_rows: 5";
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("level: warn"));
        assert!(!result.contains("${RF_TEST_LEVEL}"));
        std::env::remove_var("RF_TEST_LEVEL");
    }

    #[test]
    fn test_multiple_env_vars() {
        std::env::set_var("RF_TEST_A", "alpha");
        std::env::set_var("RF_TEST_B", "beta");
        let result = substitute_env_vars("${RF_TEST_A} and ${RF_TEST_B}").unwrap();
        assert_eq!(result, "alpha and beta");
        std::env::remove_var("RF_TEST_A");
        std::env::remove_var("RF_TEST_B");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "steps: []\nhops: []";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let result = substitute_env_vars("${RF_MISSING_X} and ${RF_MISSING_Y} ${RF_MISSING_X}");
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("RF_MISSING_X"));
        assert!(err_msg.contains("RF_MISSING_Y"));
        assert_eq!(err_msg.matches("RF_MISSING_X").count(), 1);
    }

    #[test]
    fn test_parse_pipeline_from_string() {
        std::env::set_var("RF_TEST_COPIES", "3");
        let yaml = r#"
version: "1.0"
pipeline: test
steps:
  - name: in
    use: injector
  - name: work
    use: dummy
    copies: ${RF_TEST_COPIES}
hops:
  - from: in
    to: work
"#;
        let config = parse_pipeline_str(yaml).unwrap();
        assert_eq!(config.pipeline, "test");
        assert_eq!(config.steps[1].copies, 3);
        assert_eq!(config.hops.len(), 1);
        std::env::remove_var("RF_TEST_COPIES");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        assert!(parse_pipeline_str("this is not: [valid: yaml: {{{}}}").is_err());
    }

    #[test]
    fn test_parse_pipeline_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(
            &path,
            "version: \"1.0\"\npipeline: from_file\nsteps:\n  - name: a\n    use: dummy\n",
        )
        .unwrap();
        let config = parse_pipeline(&path).unwrap();
        assert_eq!(config.pipeline, "from_file");
    }

    #[test]
    fn test_parse_pipeline_file_not_found() {
        let err_msg = parse_pipeline(Path::new("/nonexistent/pipeline.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err_msg.contains("Failed to read pipeline file"));
    }
}
