//! Row layouts.
//!
//! A [`Schema`] is the ordered list of fields every row on a hop is
//! aligned with. Schemas are immutable and shared through [`SchemaRef`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::field::FieldMeta;

/// Shared, immutable schema handle.
pub type SchemaRef = Arc<Schema>;

/// Ordered list of named, typed fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<FieldMeta>,
}

impl Schema {
    #[must_use]
    pub fn new(fields: Vec<FieldMeta>) -> Self {
        Self { fields }
    }

    /// Wrap into a shareable handle.
    #[must_use]
    pub fn into_ref(self) -> SchemaRef {
        Arc::new(self)
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, idx: usize) -> Option<&FieldMeta> {
        self.fields.get(idx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of the first field called `name`.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Two schemas are compatible when they have the same number of fields
    /// and the field types agree position by position. Names, lengths and
    /// precisions are descriptive only.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Schema) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(a, b)| a.field_type == b.field_type)
    }

    /// New schema with `extra` appended after the existing fields.
    #[must_use]
    pub fn with_fields(&self, extra: impl IntoIterator<Item = FieldMeta>) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        Self { fields }
    }
}

impl From<Vec<FieldMeta>> for Schema {
    fn from(fields: Vec<FieldMeta>) -> Self {
        Self::new(fields)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldType;

    fn people() -> Schema {
        Schema::new(vec![
            FieldMeta::new("name", FieldType::String),
            FieldMeta::new("age", FieldType::Integer),
        ])
    }

    #[test]
    fn index_of_finds_field_position() {
        let schema = people();
        assert_eq!(schema.index_of("age"), Some(1));
        assert_eq!(schema.index_of("missing"), None);
    }

    #[test]
    fn compatibility_ignores_names_and_lengths() {
        let renamed = Schema::new(vec![
            FieldMeta::new("label", FieldType::String).with_length(40),
            FieldMeta::new("years", FieldType::Integer),
        ]);
        assert!(people().is_compatible_with(&renamed));
    }

    #[test]
    fn compatibility_rejects_type_order_and_arity_changes() {
        let swapped = Schema::new(vec![
            FieldMeta::new("age", FieldType::Integer),
            FieldMeta::new("name", FieldType::String),
        ]);
        assert!(!people().is_compatible_with(&swapped));

        let shorter = Schema::new(vec![FieldMeta::new("name", FieldType::String)]);
        assert!(!people().is_compatible_with(&shorter));
    }

    #[test]
    fn with_fields_appends() {
        let extended = people().with_fields([FieldMeta::new("error_count", FieldType::Integer)]);
        assert_eq!(extended.len(), 3);
        assert_eq!(extended.field(2).unwrap().name, "error_count");
        assert_eq!(people().len(), 2);
    }

    #[test]
    fn serde_is_a_plain_field_list() {
        let json = serde_json::to_value(people()).unwrap();
        assert!(json.is_array());
        assert_eq!(json[1]["name"], "age");
        let back: Schema = serde_json::from_value(json).unwrap();
        assert_eq!(back, people());
    }

    #[test]
    fn display_lists_fields() {
        assert_eq!(people().to_string(), "[name string, age integer]");
    }
}
