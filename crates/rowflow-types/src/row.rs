//! Immutable rows.
//!
//! A [`Row`] pairs a [`SchemaRef`] with positionally aligned values. The
//! values live behind an `Arc`, so handing a row to several outputs is a
//! reference-count bump and no holder can mutate what another sees.

use std::fmt;
use std::sync::Arc;

use crate::field::FieldType;
use crate::schema::SchemaRef;
use crate::value::Value;

/// Failure building a row against a schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    #[error("row has {actual} values but schema has {expected} fields")]
    Arity { expected: usize, actual: usize },
    #[error("field '{field}' expects {expected} but got {actual}")]
    Type {
        field: String,
        expected: FieldType,
        actual: FieldType,
    },
}

/// One record flowing through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    schema: SchemaRef,
    values: Arc<[Value]>,
}

impl Row {
    /// Build a row, checking arity and the type of every non-null value.
    pub fn new(schema: SchemaRef, values: Vec<Value>) -> Result<Self, RowError> {
        if values.len() != schema.len() {
            return Err(RowError::Arity {
                expected: schema.len(),
                actual: values.len(),
            });
        }
        for (field, value) in schema.fields().iter().zip(&values) {
            if let Some(actual) = value.field_type() {
                if actual != field.field_type {
                    return Err(RowError::Type {
                        field: field.name.clone(),
                        expected: field.field_type,
                        actual,
                    });
                }
            }
        }
        Ok(Self {
            schema,
            values: values.into(),
        })
    }

    #[must_use]
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).and_then(|idx| self.values.get(idx))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// JSON object keyed by field name.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .schema
            .fields()
            .iter()
            .zip(self.values.iter())
            .map(|(field, value)| (field.name.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (field, value)) in self.schema.fields().iter().zip(self.values.iter()).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", field.name, value)?;
        }
        f.write_str("]")
    }
}
