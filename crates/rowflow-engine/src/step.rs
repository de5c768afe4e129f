//! Step logic contract, factories, and the step-type registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use rowflow_types::{Row, SchemaRef, StepError, Value};

use crate::graph::StepDecl;
use crate::logic_cache::LogicCache;

/// Whether a step wants more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// End this step-copy early. Remaining input is abandoned after the
    /// end-of-stream flush.
    Stop,
}

/// Rows produced by one call into step logic.
#[derive(Debug, Default)]
pub struct RowEmitter {
    rows: Vec<Row>,
}

impl RowEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Build a row from `values` and emit it. A value that does not fit the
    /// schema is a row-level error.
    pub fn emit_values(&mut self, schema: &SchemaRef, values: Vec<Value>) -> Result<(), StepError> {
        let row = Row::new(Arc::clone(schema), values)
            .map_err(|e| StepError::row("ROW_BUILD", e.to_string()))?;
        self.rows.push(row);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }
}

/// What a step-copy knows about its place in the running pipeline.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub pipeline: String,
    pub step: String,
    pub copy: usize,
    pub copies: usize,
    /// Number of input channels, injector entries included.
    pub inputs: usize,
    pub outputs: usize,
    pub config: serde_json::Value,
}

/// Per-row processing contract implemented by every step type.
///
/// A runner calls `init` once, then `process` for every input row (or with
/// `None`, repeatedly, when the step has no inputs), then `end_of_stream`
/// once the input is exhausted or `process` returned [`Flow::Stop`], and
/// finally `dispose`. External cancellation skips `end_of_stream`.
pub trait StepLogic: Send {
    fn init(&mut self, _ctx: &StepContext) -> Result<(), StepError> {
        Ok(())
    }

    fn process(&mut self, row: Option<&Row>, out: &mut RowEmitter) -> Result<Flow, StepError>;

    fn end_of_stream(&mut self, _out: &mut RowEmitter) -> Result<(), StepError> {
        Ok(())
    }

    fn dispose(&mut self) {}
}

/// Inputs available to a factory when instantiating one step-copy.
#[derive(Debug, Clone)]
pub struct FactoryContext {
    pub pipeline: String,
    pub decl: StepDecl,
    pub copy: usize,
    pub logic_cache: Arc<LogicCache>,
}

impl FactoryContext {
    /// The step's configuration block.
    #[must_use]
    pub fn config(&self) -> &serde_json::Value {
        &self.decl.config
    }
}

/// Creates step logic instances, one per step-copy.
pub trait StepFactory: Send + Sync {
    fn create(&self, ctx: &FactoryContext) -> Result<Box<dyn StepLogic>, StepError>;
}

impl<F> StepFactory for F
where
    F: Fn(&FactoryContext) -> Result<Box<dyn StepLogic>, StepError> + Send + Sync,
{
    fn create(&self, ctx: &FactoryContext) -> Result<Box<dyn StepLogic>, StepError> {
        self(ctx)
    }
}

#[derive(Clone)]
struct Registration {
    description: String,
    factory: Arc<dyn StepFactory>,
}

/// Step types known to a pipeline builder, by name.
#[derive(Clone, Default)]
pub struct StepRegistry {
    entries: BTreeMap<String, Registration>,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl StepRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the reference step types.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::steps::register_builtins(&mut registry);
        registry
    }

    /// Register a closure factory under `name`, replacing any previous one.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        factory: F,
    ) -> &mut Self
    where
        F: Fn(&FactoryContext) -> Result<Box<dyn StepLogic>, StepError> + Send + Sync + 'static,
    {
        self.register_factory(name, description, Arc::new(factory))
    }

    pub fn register_factory(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        factory: Arc<dyn StepFactory>,
    ) -> &mut Self {
        self.entries.insert(
            name.into(),
            Registration {
                description: description.into(),
                factory,
            },
        );
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn factory(&self, name: &str) -> Option<Arc<dyn StepFactory>> {
        self.entries.get(name).map(|r| Arc::clone(&r.factory))
    }

    /// `(name, description)` of every registered type, sorted by name.
    pub fn describe(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, r)| (name.as_str(), r.description.as_str()))
    }
}
