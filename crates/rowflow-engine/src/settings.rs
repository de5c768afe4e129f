//! Engine-wide execution settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the orchestrator does when a step-copy fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnStepError {
    /// Stop every runner on the first step-fatal error.
    #[default]
    Cascade,
    /// Let branches that do not depend on the failed step drain.
    Isolate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Default capacity of every row channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Upper bound of a single blocking wait inside a runner.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub on_step_error: OnStepError,
    #[serde(default = "default_logic_cache_size")]
    pub logic_cache_size: usize,
}

fn default_channel_capacity() -> usize {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_logic_cache_size() -> usize {
    100
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            on_step_error: OnStepError::default(),
            logic_cache_size: default_logic_cache_size(),
        }
    }
}

impl EngineSettings {
    /// Poll interval as a duration, never shorter than one millisecond.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = EngineSettings::default();
        assert_eq!(s.channel_capacity, 10_000);
        assert_eq!(s.poll_interval(), Duration::from_millis(50));
        assert_eq!(s.on_step_error, OnStepError::Cascade);
        assert_eq!(s.logic_cache_size, 100);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let s: EngineSettings = serde_yaml::from_str("on_step_error: isolate\n").unwrap();
        assert_eq!(s.on_step_error, OnStepError::Isolate);
        assert_eq!(s.channel_capacity, 10_000);
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let s = EngineSettings {
            poll_interval_ms: 0,
            ..EngineSettings::default()
        };
        assert_eq!(s.poll_interval(), Duration::from_millis(1));
    }
}
