//! Pass-through step.

use rowflow_types::{Row, StepError};

use crate::step::{FactoryContext, Flow, RowEmitter, StepLogic};

#[derive(Debug, Default)]
pub struct Dummy;

pub(crate) fn create(_ctx: &FactoryContext) -> Result<Box<dyn StepLogic>, StepError> {
    Ok(Box::new(Dummy))
}

impl StepLogic for Dummy {
    fn process(&mut self, row: Option<&Row>, out: &mut RowEmitter) -> Result<Flow, StepError> {
        match row {
            Some(row) => {
                out.emit(row.clone());
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Stop),
        }
    }
}
