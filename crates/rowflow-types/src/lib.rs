//! Shared rowflow row, schema, and error model types.
//!
//! This crate carries no execution machinery so that step implementations
//! can depend on it without pulling in the engine.

pub mod error;
pub mod field;
pub mod row;
pub mod schema;
pub mod state;
pub mod stats;
pub mod value;

pub use error::{ErrorScope, StepError};
pub use field::{FieldMeta, FieldType};
pub use row::{Row, RowError};
pub use schema::{Schema, SchemaRef};
pub use state::{AtomicStepState, StepState};
pub use stats::StepCopyStats;
pub use value::{Value, ValueError};
