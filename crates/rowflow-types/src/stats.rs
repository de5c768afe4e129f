//! Per step-copy counters.

use serde::{Deserialize, Serialize};

use crate::state::StepState;

/// Counters of one step-copy, reported once its runner terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCopyStats {
    pub step: String,
    pub copy: usize,
    pub state: StepState,
    /// The runner was cooperatively cancelled.
    pub stopped: bool,
    pub rows_read: u64,
    pub rows_written: u64,
    /// Rows redirected to an error hop.
    pub rows_rejected: u64,
    /// Rows dropped because a consumer went away or a stop interrupted a push.
    pub rows_discarded: u64,
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_secs: f64,
}

impl StepCopyStats {
    #[must_use]
    pub fn new(step: impl Into<String>, copy: usize) -> Self {
        Self {
            step: step.into(),
            copy,
            state: StepState::Created,
            stopped: false,
            rows_read: 0,
            rows_written: 0,
            rows_rejected: 0,
            rows_discarded: 0,
            errors: 0,
            error_message: None,
            duration_secs: 0.0,
        }
    }

    /// `step.copy` label used in logs and summaries.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}.{}", self.step, self.copy)
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.state == StepState::Error
    }
}
