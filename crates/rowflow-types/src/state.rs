//! Step-copy lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of one step-copy.
///
/// `Created -> Running -> {Finished | Error}`, with `Stopping` entered once
/// cancellation is observed. `Finished` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StepState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Finished = 3,
    Error = 4,
}

impl StepState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Finished,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Lock-free holder of a [`StepState`], shared between a runner and status
/// queries.
#[derive(Debug)]
pub struct AtomicStepState(AtomicU8);

impl AtomicStepState {
    #[must_use]
    pub fn new(state: StepState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[must_use]
    pub fn load(&self) -> StepState {
        StepState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: StepState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `next` unless the current state is already terminal.
    /// Returns the state that was replaced, or `None` if nothing changed.
    pub fn transition(&self, next: StepState) -> Option<StepState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if StepState::from_u8(current).is_terminal() {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return Some(StepState::from_u8(prev)),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicStepState {
    fn default() -> Self {
        Self::new(StepState::Created)
    }
}
