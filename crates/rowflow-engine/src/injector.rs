//! Handle for feeding rows into a pipeline from outside.

use std::sync::Arc;
use std::time::Duration;

use rowflow_types::{Row, RowError, SchemaRef, Value};

use crate::channel::{ChannelError, RowChannel};

#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error(transparent)]
    Row(#[from] RowError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Producer end of an entry channel bound to one step-copy.
///
/// Rows are delivered in submission order. Call [`RowInjector::finish`] once
/// every row was pushed; dropping an unfinished injector finishes it too,
/// with a warning.
#[derive(Debug)]
pub struct RowInjector {
    channel: Arc<RowChannel>,
    step: String,
    copy: usize,
    finished: bool,
}

impl RowInjector {
    pub(crate) fn new(channel: Arc<RowChannel>, step: impl Into<String>, copy: usize) -> Self {
        Self {
            channel,
            step: step.into(),
            copy,
            finished: false,
        }
    }

    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    #[must_use]
    pub fn copy(&self) -> usize {
        self.copy
    }

    /// Push a row, blocking while the entry channel is full.
    pub fn push(&self, schema: &SchemaRef, values: Vec<Value>) -> Result<(), InjectError> {
        self.push_row(Row::new(Arc::clone(schema), values)?)
    }

    /// Push a row only if there is room right now.
    pub fn try_push(&self, schema: &SchemaRef, values: Vec<Value>) -> Result<bool, InjectError> {
        let row = Row::new(Arc::clone(schema), values)?;
        Ok(self.channel.try_put(row)?)
    }

    /// Push a row, waiting at most `timeout` for room.
    pub fn push_wait(
        &self,
        schema: &SchemaRef,
        values: Vec<Value>,
        timeout: Duration,
    ) -> Result<bool, InjectError> {
        let row = Row::new(Arc::clone(schema), values)?;
        Ok(self.channel.put_wait(row, timeout)?)
    }

    /// Push an already built row, blocking while the entry channel is full.
    pub fn push_row(&self, row: Row) -> Result<(), InjectError> {
        Ok(self.channel.put(row)?)
    }

    /// Rows accepted so far.
    #[must_use]
    pub fn pushed(&self) -> u64 {
        self.channel.enqueued()
    }

    /// Signal that no more rows follow.
    pub fn finish(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if !self.finished {
            self.finished = true;
            self.channel.mark_done();
            tracing::debug!(
                step = self.step,
                copy = self.copy,
                rows = self.channel.enqueued(),
                "Injector finished"
            );
        }
    }
}

impl Drop for RowInjector {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                step = self.step,
                copy = self.copy,
                "Injector dropped without finish; closing its entry channel"
            );
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowflow_types::{FieldMeta, FieldType, Schema};

    fn schema() -> SchemaRef {
        Schema::new(vec![
            FieldMeta::new("name", FieldType::String),
            FieldMeta::new("qty", FieldType::Integer),
        ])
        .into_ref()
    }

    #[test]
    fn test_push_preserves_order_and_finish_marks_done() {
        let channel = Arc::new(RowChannel::new("entry", 8));
        let injector = RowInjector::new(Arc::clone(&channel), "in", 0);
        let s = schema();
        injector.push(&s, vec!["a".into(), 1i64.into()]).unwrap();
        injector.push(&s, vec!["b".into(), 2i64.into()]).unwrap();
        assert_eq!(injector.pushed(), 2);
        injector.finish();

        assert!(channel.is_done());
        let names: Vec<String> = std::iter::from_fn(|| channel.get())
            .map(|r| r.get(0).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_try_push_returns_false_when_full() {
        let channel = Arc::new(RowChannel::new("entry", 1));
        let injector = RowInjector::new(channel, "in", 0);
        let s = schema();
        assert!(injector.try_push(&s, vec!["a".into(), 1i64.into()]).unwrap());
        assert!(!injector.try_push(&s, vec!["b".into(), 2i64.into()]).unwrap());
        assert!(!injector
            .push_wait(&s, vec!["c".into(), 3i64.into()], Duration::from_millis(5))
            .unwrap());
    }

    #[test]
    fn test_bad_values_are_rejected_before_enqueue() {
        let channel = Arc::new(RowChannel::new("entry", 8));
        let injector = RowInjector::new(Arc::clone(&channel), "in", 0);
        let err = injector.push(&schema(), vec!["a".into()]).unwrap_err();
        assert!(matches!(err, InjectError::Row(RowError::Arity { .. })));
        assert!(channel.is_empty());
    }

    #[test]
    fn test_drop_without_finish_closes_channel() {
        let channel = Arc::new(RowChannel::new("entry", 8));
        drop(RowInjector::new(Arc::clone(&channel), "in", 0));
        assert!(channel.is_done());
    }
}
