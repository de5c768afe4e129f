//! Buffer-until-done step.
//!
//! By default only the last row received is forwarded, once every input is
//! exhausted. With `pass_all_rows` every row is forwarded as it arrives.

use rowflow_types::{Row, StepError};
use serde::Deserialize;

use crate::step::{FactoryContext, Flow, RowEmitter, StepLogic};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockingConfig {
    #[serde(default)]
    pub pass_all_rows: bool,
}

#[derive(Debug)]
pub struct Blocking {
    config: BlockingConfig,
    last: Option<Row>,
}

pub(crate) fn create(ctx: &FactoryContext) -> Result<Box<dyn StepLogic>, StepError> {
    let config: BlockingConfig = super::parse_config(ctx)?;
    Ok(Box::new(Blocking { config, last: None }))
}

impl StepLogic for Blocking {
    fn process(&mut self, row: Option<&Row>, out: &mut RowEmitter) -> Result<Flow, StepError> {
        let Some(row) = row else {
            return Ok(Flow::Stop);
        };
        if self.config.pass_all_rows {
            out.emit(row.clone());
        } else {
            self.last = Some(row.clone());
        }
        Ok(Flow::Continue)
    }

    fn end_of_stream(&mut self, out: &mut RowEmitter) -> Result<(), StepError> {
        if let Some(last) = self.last.take() {
            out.emit(last);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowflow_types::{FieldMeta, FieldType, Schema, Value};

    fn rows() -> Vec<Row> {
        let schema = Schema::new(vec![FieldMeta::new("id", FieldType::Integer)]).into_ref();
        (1..=3)
            .map(|i| Row::new(schema.clone(), vec![Value::Integer(i)]).unwrap())
            .collect()
    }

    fn run(mut step: Blocking) -> Vec<Row> {
        let mut out = RowEmitter::new();
        for row in rows() {
            step.process(Some(&row), &mut out).unwrap();
        }
        step.end_of_stream(&mut out).unwrap();
        out.take()
    }

    #[test]
    fn test_forwards_last_row_only() {
        let emitted = run(Blocking {
            config: BlockingConfig::default(),
            last: None,
        });
        assert_eq!(emitted, vec![rows().remove(2)]);
    }

    #[test]
    fn test_pass_all_rows() {
        let emitted = run(Blocking {
            config: BlockingConfig { pass_all_rows: true },
            last: None,
        });
        assert_eq!(emitted, rows());
    }

    #[test]
    fn test_empty_stream_emits_nothing() {
        let mut step = Blocking {
            config: BlockingConfig::default(),
            last: None,
        };
        let mut out = RowEmitter::new();
        step.end_of_stream(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
