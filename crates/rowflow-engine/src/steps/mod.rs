//! Built-in step types.

pub mod blocking;
pub mod dummy;
pub mod generate_rows;
pub mod write_to_log;

use rowflow_types::StepError;
use serde::de::DeserializeOwned;

use crate::step::{FactoryContext, StepRegistry};

/// Register every built-in step type.
pub fn register_builtins(registry: &mut StepRegistry) {
    registry
        .register("dummy", "Passes every row through unchanged", dummy::create)
        .register(
            "injector",
            "Entry point for rows pushed from outside the pipeline",
            dummy::create,
        )
        .register(
            "blocking",
            "Holds rows until end of stream and forwards the last one",
            blocking::create,
        )
        .register(
            "generate_rows",
            "Emits a fixed set of configured rows",
            generate_rows::create,
        )
        .register(
            "write_to_log",
            "Logs every row and passes it on",
            write_to_log::create,
        );
}

/// Deserialize the step's config block. A missing block yields the default.
pub(crate) fn parse_config<T>(ctx: &FactoryContext) -> Result<T, StepError>
where
    T: DeserializeOwned + Default,
{
    if ctx.config().is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(ctx.config().clone()).map_err(|e| {
        StepError::config(
            "INVALID_CONFIG",
            format!("step '{}': {e}", ctx.decl.name),
        )
    })
}
