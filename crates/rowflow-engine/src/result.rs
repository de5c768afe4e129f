//! Aggregate outcome of a pipeline run.

use std::fmt;

use rowflow_types::{StepCopyStats, StepState};
use serde::Serialize;

/// Result of a pipeline run, built once every runner reached a terminal
/// state (or, for a timed-out wait, from the runners that did).
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    /// No runner ended in error and no row error was counted.
    pub success: bool,
    /// The run was cancelled, by request or by a failing step.
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_rejected: u64,
    pub rows_discarded: u64,
    pub error_count: u64,
    pub duration_secs: f64,
    pub steps: Vec<StepCopyStats>,
}

impl PipelineResult {
    pub(crate) fn from_steps(
        pipeline: impl Into<String>,
        steps: Vec<StepCopyStats>,
        stop_reason: Option<String>,
        duration_secs: f64,
    ) -> Self {
        let sum = |f: fn(&StepCopyStats) -> u64| steps.iter().map(f).sum::<u64>();
        let rows_read = sum(|s| s.rows_read);
        let rows_written = sum(|s| s.rows_written);
        let rows_rejected = sum(|s| s.rows_rejected);
        let rows_discarded = sum(|s| s.rows_discarded);
        let error_count = sum(|s| s.errors);
        let failed = steps.iter().any(|s| s.state == StepState::Error);
        Self {
            pipeline: pipeline.into(),
            success: !failed && error_count == 0,
            stopped: stop_reason.is_some(),
            stop_reason,
            rows_read,
            rows_written,
            rows_rejected,
            rows_discarded,
            error_count,
            duration_secs,
            steps,
        }
    }

    /// Stats of every copy of `step`, in copy order.
    #[must_use]
    pub fn step(&self, name: &str) -> Vec<&StepCopyStats> {
        self.steps.iter().filter(|s| s.step == name).collect()
    }

    /// Rows written by all copies of `step`.
    #[must_use]
    pub fn rows_written_by(&self, name: &str) -> u64 {
        self.step(name).iter().map(|s| s.rows_written).sum()
    }

    /// Rows read by all copies of `step`.
    #[must_use]
    pub fn rows_read_by(&self, name: &str) -> u64 {
        self.step(name).iter().map(|s| s.rows_read).sum()
    }

    /// Step copies that ended in error.
    pub fn failures(&self) -> impl Iterator<Item = &StepCopyStats> {
        self.steps.iter().filter(|s| s.failed())
    }
}

/// Outcome of building a pipeline without running it.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub pipeline: String,
    pub steps: usize,
    pub step_copies: usize,
    pub channels: usize,
    /// Step names, producers before consumers.
    pub order: Vec<String>,
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipeline '{}' is valid: {} steps, {} step copies, {} channels\n  Order: {}",
            self.pipeline,
            self.steps,
            self.step_copies,
            self.channels,
            self.order.join(" -> ")
        )
    }
}

impl fmt::Display for PipelineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (self.success, self.stopped) {
            (true, false) => "succeeded",
            (true, true) => "stopped",
            (false, _) => "failed",
        };
        writeln!(f, "Pipeline '{}' {status}", self.pipeline)?;
        writeln!(f, "  Rows read:      {}", self.rows_read)?;
        writeln!(f, "  Rows written:   {}", self.rows_written)?;
        writeln!(f, "  Rows rejected:  {}", self.rows_rejected)?;
        writeln!(f, "  Rows discarded: {}", self.rows_discarded)?;
        writeln!(f, "  Errors:         {}", self.error_count)?;
        write!(f, "  Duration:       {:.2}s", self.duration_secs)?;
        if let Some(reason) = &self.stop_reason {
            write!(f, "\n  Stop reason:    {reason}")?;
        }
        for step in &self.steps {
            write!(
                f,
                "\n  {:<24} {:<9} read={} written={} rejected={} discarded={} errors={}",
                step.label(),
                step.state,
                step.rows_read,
                step.rows_written,
                step.rows_rejected,
                step.rows_discarded,
                step.errors
            )?;
        }
        Ok(())
    }
}
