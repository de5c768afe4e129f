//! Step that logs every row it sees and passes it on.

use rowflow_types::{Row, StepError};
use serde::Deserialize;

use crate::step::{FactoryContext, Flow, RowEmitter, StepContext, StepLogic};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteToLogConfig {
    #[serde(default)]
    pub level: LogLevel,
    /// Prefix printed before every row.
    #[serde(default)]
    pub message: Option<String>,
    /// Log only the first `limit_rows` rows. All rows still pass through.
    #[serde(default)]
    pub limit_rows: Option<u64>,
}

#[derive(Debug)]
pub struct WriteToLog {
    config: WriteToLogConfig,
    label: String,
    logged: u64,
}

pub(crate) fn create(ctx: &FactoryContext) -> Result<Box<dyn StepLogic>, StepError> {
    let config: WriteToLogConfig = super::parse_config(ctx)?;
    Ok(Box::new(WriteToLog {
        config,
        label: format!("{}.{}", ctx.decl.name, ctx.copy),
        logged: 0,
    }))
}

impl WriteToLog {
    fn log(&self, row: &Row) {
        let message = self.config.message.as_deref().unwrap_or("");
        let step = self.label.as_str();
        match self.config.level {
            LogLevel::Trace => tracing::trace!(step, "{message}{row}"),
            LogLevel::Debug => tracing::debug!(step, "{message}{row}"),
            LogLevel::Info => tracing::info!(step, "{message}{row}"),
            LogLevel::Warn => tracing::warn!(step, "{message}{row}"),
            LogLevel::Error => tracing::error!(step, "{message}{row}"),
        }
    }
}

impl StepLogic for WriteToLog {
    fn init(&mut self, ctx: &StepContext) -> Result<(), StepError> {
        self.label = format!("{}.{}", ctx.step, ctx.copy);
        Ok(())
    }

    fn process(&mut self, row: Option<&Row>, out: &mut RowEmitter) -> Result<Flow, StepError> {
        let Some(row) = row else {
            return Ok(Flow::Stop);
        };
        if self.config.limit_rows.map_or(true, |limit| self.logged < limit) {
            self.log(row);
            self.logged += 1;
        }
        out.emit(row.clone());
        Ok(Flow::Continue)
    }
}
