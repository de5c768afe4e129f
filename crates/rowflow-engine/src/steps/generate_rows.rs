//! Source step emitting configured rows.
//!
//! ```yaml
//! use: generate_rows
//! config:
//!   fields: [{name: id, type: integer}, {name: name, type: string}]
//!   rows:
//!     - [1, alice]
//!     - {id: 2, name: bob}
//!   limit: 10   # cycle through `rows` until 10 rows were emitted
//! ```

use rowflow_types::{FieldMeta, Row, Schema, SchemaRef, StepError, Value};
use serde::Deserialize;

use crate::step::{FactoryContext, Flow, RowEmitter, StepLogic};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateRowsConfig {
    #[serde(default)]
    pub fields: Vec<FieldMeta>,
    #[serde(default)]
    pub rows: Vec<serde_json::Value>,
    /// Total rows to emit. Defaults to the number of configured rows.
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug)]
pub struct GenerateRows {
    schema: SchemaRef,
    templates: Vec<Vec<Value>>,
    limit: u64,
    emitted: u64,
}

pub(crate) fn create(ctx: &FactoryContext) -> Result<Box<dyn StepLogic>, StepError> {
    let config: GenerateRowsConfig = super::parse_config(ctx)?;
    Ok(Box::new(GenerateRows::from_config(config)?))
}

impl GenerateRows {
    pub fn from_config(config: GenerateRowsConfig) -> Result<Self, StepError> {
        let schema = Schema::new(config.fields).into_ref();
        let mut templates = config
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| parse_row(&schema, row).map_err(|msg| {
                StepError::config("INVALID_ROW", format!("rows[{i}]: {msg}"))
            }))
            .collect::<Result<Vec<_>, _>>()?;
        let limit = config.limit.unwrap_or(templates.len() as u64);
        if templates.is_empty() && limit > 0 {
            templates.push(vec![Value::Null; schema.len()]);
        }
        Ok(Self {
            schema,
            templates,
            limit,
            emitted: 0,
        })
    }
}

fn parse_row(schema: &Schema, row: &serde_json::Value) -> Result<Vec<Value>, String> {
    match row {
        serde_json::Value::Array(items) => {
            if items.len() != schema.len() {
                return Err(format!(
                    "has {} values but {} fields are declared",
                    items.len(),
                    schema.len()
                ));
            }
            schema
                .fields()
                .iter()
                .zip(items)
                .map(|(field, json)| {
                    Value::from_json(json, field.field_type)
                        .map_err(|e| format!("field '{}': {e}", field.name))
                })
                .collect()
        }
        serde_json::Value::Object(map) => {
            if let Some(unknown) = map.keys().find(|k| schema.index_of(k).is_none()) {
                return Err(format!("unknown field '{unknown}'"));
            }
            schema
                .fields()
                .iter()
                .map(|field| {
                    map.get(&field.name).map_or(Ok(Value::Null), |json| {
                        Value::from_json(json, field.field_type)
                            .map_err(|e| format!("field '{}': {e}", field.name))
                    })
                })
                .collect()
        }
        other => Err(format!("expected a list or a map, got {other}")),
    }
}

impl StepLogic for GenerateRows {
    fn process(&mut self, _row: Option<&Row>, out: &mut RowEmitter) -> Result<Flow, StepError> {
        if self.emitted >= self.limit {
            return Ok(Flow::Stop);
        }
        let idx = usize::try_from(self.emitted).unwrap_or(0) % self.templates.len();
        out.emit_values(&self.schema, self.templates[idx].clone())?;
        self.emitted += 1;
        Ok(if self.emitted >= self.limit {
            Flow::Stop
        } else {
            Flow::Continue
        })
    }
}
