//! Step runner: drives one step-copy on a blocking worker thread.
//!
//! A runner pulls rows from its input channels, hands them to the step
//! logic, and pushes what the logic emits to its output channels. Every
//! blocking wait is bounded by the poll interval so that cancellation is
//! observed between attempts. Whatever way the runner exits, its outputs are
//! marked done (errored on failure) and undrained inputs are abandoned, so
//! neighbouring step-copies never wait forever.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rowflow_types::{
    AtomicStepState, FieldMeta, FieldType, Row, SchemaRef, StepCopyStats, StepError, StepState,
    Value,
};

use crate::channel::{ChannelError, Recv, RowChannel};
use crate::graph::{FanPolicy, InputPolicy, RowErrorPolicy};
use crate::settings::OnStepError;
use crate::step::{Flow, RowEmitter, StepContext, StepLogic};

/// Fields appended to the input layout of an error row.
pub const ERROR_FIELDS: [&str; 4] = [
    "error_count",
    "error_description",
    "error_fields",
    "error_codes",
];

/// Observer of the rows one step-copy reads, writes, and rejects.
pub trait RowListener: Send + Sync {
    fn row_read(&self, _row: &Row) {}
    fn row_written(&self, _row: &Row) {}
    fn error_row(&self, _row: &Row, _error: &StepError) {}
}

/// Listener that keeps every observed row in memory.
#[derive(Debug, Default)]
pub struct RowCollector {
    read: Mutex<Vec<Row>>,
    written: Mutex<Vec<Row>>,
    errors: Mutex<Vec<(Row, StepError)>>,
}

impl RowCollector {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn rows_read(&self) -> Vec<Row> {
        self.read.lock().clone()
    }

    #[must_use]
    pub fn rows_written(&self) -> Vec<Row> {
        self.written.lock().clone()
    }

    #[must_use]
    pub fn error_rows(&self) -> Vec<(Row, StepError)> {
        self.errors.lock().clone()
    }
}

impl RowListener for RowCollector {
    fn row_read(&self, row: &Row) {
        self.read.lock().push(row.clone());
    }

    fn row_written(&self, row: &Row) {
        self.written.lock().push(row.clone());
    }

    fn error_row(&self, row: &Row, error: &StepError) {
        self.errors.lock().push((row.clone(), error.clone()));
    }
}

/// Pipeline-wide cancellation flag. The first reason given wins.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request every runner to stop. Returns `false` if a stop was already
    /// requested.
    pub fn stop(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason.into());
        self.stopped.store(true, Ordering::Release);
        true
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// Lock-free view of one runner, shared with the orchestrator.
#[derive(Debug, Default)]
pub struct RunnerControl {
    state: AtomicStepState,
    stop: AtomicBool,
    errors: AtomicU64,
}

impl RunnerControl {
    #[must_use]
    pub fn state(&self) -> StepState {
        self.state.load()
    }

    /// Ask this runner alone to stop.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.state() == StepState::Error || self.errors.load(Ordering::Acquire) > 0
    }
}

/// The consumer copies one producer copy reaches through one hop.
pub(crate) struct OutputHop {
    fan: FanPolicy,
    targets: Vec<Arc<RowChannel>>,
    cursor: usize,
}

impl OutputHop {
    pub(crate) fn new(fan: FanPolicy, targets: Vec<Arc<RowChannel>>) -> Self {
        Self {
            fan,
            targets,
            cursor: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.targets.len()
    }

    /// Next consumer copy in round-robin order, preferring ones that are
    /// still listening.
    fn next_target(&mut self) -> Option<Arc<RowChannel>> {
        let n = self.targets.len();
        if n == 0 {
            return None;
        }
        let start = self.cursor;
        let pick = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| !self.targets[i].is_abandoned())
            .unwrap_or(start % n);
        self.cursor = (pick + 1) % n;
        Some(Arc::clone(&self.targets[pick]))
    }
}

/// All output hops of one step-copy, grouped by fan policy.
struct OutputSet {
    copy_hops: Vec<OutputHop>,
    distribute_hops: Vec<OutputHop>,
    cursor: usize,
}

impl OutputSet {
    fn new(hops: Vec<OutputHop>) -> Self {
        let (copy_hops, distribute_hops) =
            hops.into_iter().partition(|h| h.fan == FanPolicy::Copy);
        Self {
            copy_hops,
            distribute_hops,
            cursor: 0,
        }
    }

    fn channels(&self) -> impl Iterator<Item = &Arc<RowChannel>> {
        self.copy_hops
            .iter()
            .chain(&self.distribute_hops)
            .flat_map(|h| &h.targets)
    }

    fn is_empty(&self) -> bool {
        self.channels().next().is_none()
    }

    fn all_abandoned(&self) -> bool {
        !self.is_empty() && self.channels().all(|c| c.is_abandoned())
    }

    /// Channels the next row goes to.
    fn route(&mut self) -> Vec<Arc<RowChannel>> {
        let mut targets: Vec<Arc<RowChannel>> =
            self.copy_hops.iter_mut().filter_map(OutputHop::next_target).collect();
        if !self.distribute_hops.is_empty() {
            let idx = self.cursor % self.distribute_hops.len();
            self.cursor = self.cursor.wrapping_add(1);
            if let Some(target) = self.distribute_hops[idx].next_target() {
                targets.push(target);
            }
        }
        targets
    }
}

enum Next {
    Row(Row),
    Pending,
    Exhausted,
}

/// Input channels of one step-copy, read according to an [`InputPolicy`].
struct InputSet {
    channels: Vec<Arc<RowChannel>>,
    drained: Vec<bool>,
    /// First input whose producer failed.
    failed: Option<usize>,
    policy: InputPolicy,
    cursor: usize,
}

impl InputSet {
    fn new(channels: Vec<Arc<RowChannel>>, policy: InputPolicy) -> Self {
        let drained = vec![false; channels.len()];
        Self {
            channels,
            drained,
            failed: None,
            policy,
            cursor: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Name of an input that ended because its producer failed.
    fn failed_input(&self) -> Option<&str> {
        self.failed.map(|i| self.channels[i].name())
    }

    fn mark_drained(&mut self, i: usize) {
        self.drained[i] = true;
        if self.failed.is_none() && self.channels[i].is_errored() {
            self.failed = Some(i);
        }
    }

    fn next(&mut self, poll: Duration) -> Next {
        match self.policy {
            InputPolicy::Sequential => self.next_sequential(poll),
            InputPolicy::RoundRobin => self.next_round_robin(poll),
        }
    }

    fn next_sequential(&mut self, poll: Duration) -> Next {
        while let Some(i) = self.drained.iter().position(|d| !d) {
            match self.channels[i].get_wait(poll) {
                Recv::Row(row) => return Next::Row(row),
                Recv::Done => self.mark_drained(i),
                Recv::TimedOut => return Next::Pending,
            }
        }
        Next::Exhausted
    }

    fn next_round_robin(&mut self, poll: Duration) -> Next {
        let n = self.channels.len();
        for offset in 0..n {
            let i = (self.cursor + offset) % n;
            if self.drained[i] {
                continue;
            }
            match self.channels[i].try_get() {
                Recv::Row(row) => {
                    self.cursor = (i + 1) % n;
                    return Next::Row(row);
                }
                Recv::Done => self.mark_drained(i),
                Recv::TimedOut => {}
            }
        }

        // Nothing queued anywhere: block on the next live input.
        let Some(i) = (0..n)
            .map(|offset| (self.cursor + offset) % n)
            .find(|&i| !self.drained[i])
        else {
            return Next::Exhausted;
        };
        self.cursor = (i + 1) % n;
        match self.channels[i].get_wait(poll) {
            Recv::Row(row) => Next::Row(row),
            Recv::Done => {
                self.mark_drained(i);
                Next::Pending
            }
            Recv::TimedOut => Next::Pending,
        }
    }
}

/// Closes a runner's channels when dropped without an explicit close, which
/// only happens if the runner unwinds past its panic boundary.
struct ChannelGuard {
    outputs: Vec<Arc<RowChannel>>,
    inputs: Vec<Arc<RowChannel>>,
    armed: bool,
}

impl ChannelGuard {
    /// Mark outputs done, abandon undrained inputs, and return how many
    /// queued input rows were dropped.
    fn close(&mut self, failed: bool) -> u64 {
        self.armed = false;
        for channel in &self.outputs {
            if failed {
                channel.mark_errored();
            } else {
                channel.mark_done();
            }
        }
        self.inputs
            .iter()
            .filter(|c| !(c.is_done() && c.is_empty()))
            .map(|c| c.abandon() as u64)
            .sum()
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.close(true);
        }
    }
}

/// Everything a runner needs besides the shared control handles.
pub(crate) struct RunnerSpec {
    pub ctx: StepContext,
    pub logic: Box<dyn StepLogic>,
    pub inputs: Vec<Arc<RowChannel>>,
    pub input_policy: InputPolicy,
    pub outputs: Vec<OutputHop>,
    pub error_outputs: Vec<OutputHop>,
    pub on_row_error: RowErrorPolicy,
    pub listeners: Vec<Arc<dyn RowListener>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    /// Every input was drained.
    Exhausted,
    /// The logic returned [`Flow::Stop`].
    Halted,
    /// Every output channel was abandoned by its consumer.
    Unwanted,
    /// Cancellation was observed.
    Stopped,
}

enum Delivery {
    Delivered,
    Stopped,
}

enum Put {
    Accepted,
    Discarded,
    Stopped,
}

/// Executes one step-copy.
pub(crate) struct StepRunner {
    ctx: StepContext,
    logic: Box<dyn StepLogic>,
    inputs: InputSet,
    outputs: OutputSet,
    error_outputs: OutputSet,
    on_row_error: RowErrorPolicy,
    listeners: Vec<Arc<dyn RowListener>>,
    control: Arc<RunnerControl>,
    signal: Arc<StopSignal>,
    on_step_error: OnStepError,
    poll: Duration,
    stats: StepCopyStats,
    error_layout: Option<(SchemaRef, SchemaRef)>,
}

impl StepRunner {
    pub(crate) fn new(
        spec: RunnerSpec,
        control: Arc<RunnerControl>,
        signal: Arc<StopSignal>,
        on_step_error: OnStepError,
        poll: Duration,
    ) -> Self {
        let stats = StepCopyStats::new(spec.ctx.step.clone(), spec.ctx.copy);
        Self {
            inputs: InputSet::new(spec.inputs, spec.input_policy),
            outputs: OutputSet::new(spec.outputs),
            error_outputs: OutputSet::new(spec.error_outputs),
            ctx: spec.ctx,
            logic: spec.logic,
            on_row_error: spec.on_row_error,
            listeners: spec.listeners,
            control,
            signal,
            on_step_error,
            poll,
            stats,
            error_layout: None,
        }
    }

    /// Run to completion and report the final counters. Never panics out:
    /// a panic in step logic becomes a step-fatal error.
    pub(crate) fn run(mut self) -> StepCopyStats {
        let started = Instant::now();
        let mut guard = ChannelGuard {
            outputs: self
                .outputs
                .channels()
                .chain(self.error_outputs.channels())
                .cloned()
                .collect(),
            inputs: self.inputs.channels.clone(),
            armed: true,
        };
        self.control.state.transition(StepState::Running);
        tracing::debug!(
            pipeline = self.ctx.pipeline,
            step = self.ctx.step,
            copy = self.ctx.copy,
            inputs = self.ctx.inputs,
            outputs = self.ctx.outputs,
            "Step copy started"
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute()))
            .unwrap_or_else(|payload| {
                Err(StepError::fatal(
                    "PANIC",
                    format!("step panicked: {}", panic_message(payload.as_ref())),
                ))
            });

        if let Err(error) = &outcome {
            tracing::error!(
                step = self.ctx.step,
                copy = self.ctx.copy,
                code = %error.code,
                "Step copy failed: {}",
                error.message
            );
            if self.on_step_error == OnStepError::Cascade {
                self.signal.stop(format!(
                    "step '{}' copy {} failed: {error}",
                    self.ctx.step, self.ctx.copy
                ));
            }
        }

        self.stats.rows_discarded += guard.close(outcome.is_err());
        if panic::catch_unwind(AssertUnwindSafe(|| self.logic.dispose())).is_err() {
            tracing::warn!(step = self.ctx.step, copy = self.ctx.copy, "Step dispose panicked");
        }

        let final_state = match outcome {
            Ok(termination) => {
                self.stats.stopped = termination == Termination::Stopped;
                StepState::Finished
            }
            Err(error) => {
                self.record_error();
                self.stats.error_message = Some(error.to_string());
                StepState::Error
            }
        };
        self.control.state.transition(final_state);
        self.stats.state = final_state;
        self.stats.duration_secs = started.elapsed().as_secs_f64();

        tracing::info!(
            step = self.ctx.step,
            copy = self.ctx.copy,
            state = %final_state,
            stopped = self.stats.stopped,
            rows_read = self.stats.rows_read,
            rows_written = self.stats.rows_written,
            rows_rejected = self.stats.rows_rejected,
            rows_discarded = self.stats.rows_discarded,
            errors = self.stats.errors,
            duration_secs = self.stats.duration_secs,
            "Step copy finished"
        );
        self.stats
    }

    fn execute(&mut self) -> Result<Termination, StepError> {
        self.logic.init(&self.ctx).map_err(StepError::escalate)?;

        loop {
            if self.stop_requested() {
                return Ok(Termination::Stopped);
            }
            if self.outputs.all_abandoned() {
                tracing::debug!(step = self.ctx.step, copy = self.ctx.copy, "All consumers left");
                return Ok(Termination::Unwanted);
            }

            let row = if self.inputs.is_empty() {
                None
            } else {
                match self.inputs.next(self.poll) {
                    Next::Row(row) => Some(row),
                    Next::Pending => continue,
                    // Upstream may have closed because of the stop itself.
                    Next::Exhausted if self.stop_requested() => {
                        return Ok(Termination::Stopped);
                    }
                    Next::Exhausted => {
                        // A failed producer leaves the stream truncated: no flush.
                        if let Some(input) = self.inputs.failed_input() {
                            return Err(StepError::fatal(
                                "UPSTREAM_FAILED",
                                format!("input '{input}' was closed by a failed producer"),
                            ));
                        }
                        return Ok(if self.flush()? {
                            Termination::Exhausted
                        } else {
                            Termination::Stopped
                        });
                    }
                }
            };

            if let Some(row) = &row {
                self.stats.rows_read += 1;
                for listener in &self.listeners {
                    listener.row_read(row);
                }
            }

            let mut out = RowEmitter::new();
            let result = self.logic.process(row.as_ref(), &mut out);
            if !self.deliver_all(out.take())? {
                return Ok(Termination::Stopped);
            }
            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    return Ok(if self.flush()? {
                        Termination::Halted
                    } else {
                        Termination::Stopped
                    });
                }
                Err(error) if error.is_row_level() => {
                    if !self.handle_row_error(row.as_ref(), error)? {
                        return Ok(Termination::Stopped);
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Run `end_of_stream` and push its rows. `Ok(false)` if a stop
    /// interrupted the push.
    fn flush(&mut self) -> Result<bool, StepError> {
        let mut out = RowEmitter::new();
        let result = self.logic.end_of_stream(&mut out);
        if !self.deliver_all(out.take())? {
            return Ok(false);
        }
        match result {
            Ok(()) => Ok(true),
            Err(error) if error.is_row_level() => self.handle_row_error(None, error),
            Err(error) => Err(error),
        }
    }

    fn deliver_all(&mut self, rows: Vec<Row>) -> Result<bool, StepError> {
        let total = rows.len();
        for (idx, row) in rows.into_iter().enumerate() {
            if let Delivery::Stopped = self.deliver(row, false)? {
                self.stats.rows_discarded += (total - idx - 1) as u64;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn deliver(&mut self, row: Row, error_row: bool) -> Result<Delivery, StepError> {
        let targets = if error_row {
            self.error_outputs.route()
        } else {
            self.outputs.route()
        };

        let mut accepted = targets.is_empty();
        for channel in &targets {
            match self.put(channel, &row)? {
                Put::Accepted => accepted = true,
                Put::Discarded => {}
                Put::Stopped => return Ok(Delivery::Stopped),
            }
        }

        if accepted && !error_row {
            self.stats.rows_written += 1;
            for listener in &self.listeners {
                listener.row_written(&row);
            }
        }
        Ok(Delivery::Delivered)
    }

    fn put(&mut self, channel: &RowChannel, row: &Row) -> Result<Put, StepError> {
        loop {
            if self.stop_requested() {
                self.stats.rows_discarded += 1;
                return Ok(Put::Stopped);
            }
            match channel.put_wait(row.clone(), self.poll) {
                Ok(true) => return Ok(Put::Accepted),
                Ok(false) => {}
                Err(ChannelError::Abandoned { .. }) => {
                    self.stats.rows_discarded += 1;
                    tracing::trace!(channel = channel.name(), "Row discarded, consumer left");
                    return Ok(Put::Discarded);
                }
                Err(e @ ChannelError::SchemaMismatch { .. }) => {
                    return Err(StepError::fatal("SCHEMA_MISMATCH", e.to_string()));
                }
                Err(e @ ChannelError::Done { .. }) => {
                    return Err(StepError::fatal("CHANNEL_CLOSED", e.to_string()));
                }
            }
        }
    }

    /// Apply the row error policy. `Ok(false)` if a stop interrupted the
    /// delivery of an error row.
    fn handle_row_error(&mut self, row: Option<&Row>, error: StepError) -> Result<bool, StepError> {
        match (self.on_row_error, row) {
            (RowErrorPolicy::Fail, _) => Err(error.escalate()),
            (RowErrorPolicy::Redirect, Some(row)) => {
                let error_row = self.error_row(row, &error)?;
                self.stats.rows_rejected += 1;
                for listener in &self.listeners {
                    listener.error_row(&error_row, &error);
                }
                tracing::debug!(
                    step = self.ctx.step,
                    copy = self.ctx.copy,
                    code = %error.code,
                    "Row redirected to error hop"
                );
                Ok(matches!(self.deliver(error_row, true)?, Delivery::Delivered))
            }
            // Without an input row there is nothing to redirect.
            (RowErrorPolicy::Skip | RowErrorPolicy::Redirect, _) => {
                self.record_error();
                tracing::warn!(
                    step = self.ctx.step,
                    copy = self.ctx.copy,
                    code = %error.code,
                    "Row skipped: {}",
                    error.message
                );
                Ok(true)
            }
        }
    }

    fn error_row(&mut self, row: &Row, error: &StepError) -> Result<Row, StepError> {
        let schema = self.error_layout_for(row.schema());
        let mut values = row.values().to_vec();
        values.extend([
            Value::Integer(1),
            Value::String(error.message.clone()),
            Value::String(error.fields.join(",")),
            Value::String(error.code.clone()),
        ]);
        Row::new(schema, values).map_err(|e| StepError::fatal("ERROR_ROW", e.to_string()))
    }

    fn error_layout_for(&mut self, input: &SchemaRef) -> SchemaRef {
        if let Some((cached, layout)) = &self.error_layout {
            if Arc::ptr_eq(cached, input) {
                return Arc::clone(layout);
            }
        }
        let layout = error_schema(input);
        self.error_layout = Some((Arc::clone(input), Arc::clone(&layout)));
        layout
    }

    fn record_error(&mut self) {
        self.stats.errors += 1;
        self.control.errors.fetch_add(1, Ordering::AcqRel);
    }

    fn stop_requested(&self) -> bool {
        let requested = self.control.stop.load(Ordering::Acquire) || self.signal.is_stopped();
        if requested && self.control.state.load() == StepState::Running {
            self.control.state.transition(StepState::Stopping);
        }
        requested
    }
}

/// Layout of error rows produced from rows of `input`.
#[must_use]
pub fn error_schema(input: &SchemaRef) -> SchemaRef {
    let [count, description, fields, codes] = ERROR_FIELDS;
    input
        .with_fields([
            FieldMeta::new(count, FieldType::Integer),
            FieldMeta::new(description, FieldType::String),
            FieldMeta::new(fields, FieldType::String),
            FieldMeta::new(codes, FieldType::String),
        ])
        .into_ref()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowflow_types::{FieldMeta, Schema};
    use std::thread;

    fn schema() -> SchemaRef {
        Schema::new(vec![FieldMeta::new("id", FieldType::Integer)]).into_ref()
    }

    fn row(schema: &SchemaRef, id: i64) -> Row {
        Row::new(Arc::clone(schema), vec![Value::Integer(id)]).unwrap()
    }

    fn id_of(row: &Row) -> i64 {
        match row.get(0) {
            Some(Value::Integer(id)) => *id,
            other => panic!("unexpected value {other:?}"),
        }
    }

    fn ctx(step: &str) -> StepContext {
        StepContext {
            pipeline: "test".into(),
            step: step.into(),
            copy: 0,
            copies: 1,
            inputs: 1,
            outputs: 1,
            config: serde_json::Value::Null,
        }
    }

    /// Passes rows through; rows with a negative id raise a row error and
    /// id 99 panics.
    struct Checked;

    impl StepLogic for Checked {
        fn process(&mut self, row: Option<&Row>, out: &mut RowEmitter) -> Result<Flow, StepError> {
            let Some(row) = row else {
                return Ok(Flow::Stop);
            };
            match id_of(row) {
                99 => panic!("boom"),
                id if id < 0 => {
                    Err(StepError::row("NEGATIVE", "id must be positive").with_fields(["id"]))
                }
                _ => {
                    out.emit(row.clone());
                    Ok(Flow::Continue)
                }
            }
        }
    }

    struct TakeTwo {
        seen: usize,
    }

    impl StepLogic for TakeTwo {
        fn process(&mut self, row: Option<&Row>, out: &mut RowEmitter) -> Result<Flow, StepError> {
            if let Some(row) = row {
                out.emit(row.clone());
                self.seen += 1;
            }
            Ok(if self.seen >= 2 { Flow::Stop } else { Flow::Continue })
        }
    }

    /// Holds the last row until end of stream.
    #[derive(Default)]
    struct Blocking {
        last: Option<Row>,
    }

    impl StepLogic for Blocking {
        fn process(&mut self, row: Option<&Row>, _out: &mut RowEmitter) -> Result<Flow, StepError> {
            match row {
                Some(row) => {
                    self.last = Some(row.clone());
                    Ok(Flow::Continue)
                }
                None => Ok(Flow::Stop),
            }
        }

        fn end_of_stream(&mut self, out: &mut RowEmitter) -> Result<(), StepError> {
            if let Some(row) = self.last.take() {
                out.emit(row);
            }
            Ok(())
        }
    }

    struct Harness {
        input: Arc<RowChannel>,
        output: Arc<RowChannel>,
        errors: Arc<RowChannel>,
        control: Arc<RunnerControl>,
        signal: Arc<StopSignal>,
    }

    fn runner(logic: Box<dyn StepLogic>, policy: RowErrorPolicy) -> (StepRunner, Harness) {
        let h = Harness {
            input: Arc::new(RowChannel::new("in", 16)),
            output: Arc::new(RowChannel::new("out", 16)),
            errors: Arc::new(RowChannel::new("err", 16)),
            control: Arc::new(RunnerControl::default()),
            signal: Arc::new(StopSignal::new()),
        };
        let spec = RunnerSpec {
            ctx: ctx("checked"),
            logic,
            inputs: vec![Arc::clone(&h.input)],
            input_policy: InputPolicy::RoundRobin,
            outputs: vec![OutputHop::new(FanPolicy::Copy, vec![Arc::clone(&h.output)])],
            error_outputs: vec![OutputHop::new(FanPolicy::Copy, vec![Arc::clone(&h.errors)])],
            on_row_error: policy,
            listeners: Vec::new(),
        };
        let runner = StepRunner::new(
            spec,
            Arc::clone(&h.control),
            Arc::clone(&h.signal),
            OnStepError::Cascade,
            Duration::from_millis(5),
        );
        (runner, h)
    }

    fn feed(channel: &RowChannel, ids: &[i64]) {
        let s = schema();
        for &id in ids {
            channel.put(row(&s, id)).unwrap();
        }
        channel.mark_done();
    }

    fn drain(channel: &RowChannel) -> Vec<Row> {
        std::iter::from_fn(|| channel.get()).collect()
    }

    #[test]
    fn test_pass_through_and_done_propagation() {
        let (runner, h) = runner(Box::new(Checked), RowErrorPolicy::Fail);
        feed(&h.input, &[1, 2, 3]);
        let stats = runner.run();
        assert_eq!(stats.state, StepState::Finished);
        assert_eq!((stats.rows_read, stats.rows_written), (3, 3));
        assert!(h.output.is_done());
        assert!(!h.output.is_errored());
        let ids: Vec<i64> = drain(&h.output).iter().map(id_of).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(h.control.state(), StepState::Finished);
    }

    #[test]
    fn test_fail_policy_escalates_and_cascades() {
        let (runner, h) = runner(Box::new(Checked), RowErrorPolicy::Fail);
        feed(&h.input, &[1, -1, 2]);
        let stats = runner.run();
        assert_eq!(stats.state, StepState::Error);
        assert_eq!(stats.errors, 1);
        assert!(stats.error_message.unwrap().contains("NEGATIVE"));
        assert!(h.output.is_errored());
        assert!(h.signal.is_stopped());
        assert!(h.control.has_errors());
        // The undelivered row 2 was dropped with the abandoned input.
        assert_eq!(stats.rows_discarded, 1);
    }

    #[test]
    fn test_skip_policy_counts_error() {
        let (runner, h) = runner(Box::new(Checked), RowErrorPolicy::Skip);
        feed(&h.input, &[1, -1, 2]);
        let stats = runner.run();
        assert_eq!(stats.state, StepState::Finished);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.rows_written, 2);
        assert!(h.control.has_errors());
    }

    #[test]
    fn test_redirect_policy_emits_error_row() {
        let (runner, h) = runner(Box::new(Checked), RowErrorPolicy::Redirect);
        feed(&h.input, &[1, -5]);
        let stats = runner.run();
        assert_eq!(stats.state, StepState::Finished);
        assert_eq!(stats.rows_rejected, 1);
        assert_eq!(stats.errors, 0);

        let errors = drain(&h.errors);
        assert_eq!(errors.len(), 1);
        let err_row = &errors[0];
        assert_eq!(err_row.len(), 5);
        assert_eq!(err_row.get_by_name("id"), Some(&Value::Integer(-5)));
        assert_eq!(err_row.get_by_name("error_count"), Some(&Value::Integer(1)));
        assert_eq!(err_row.get_by_name("error_fields"), Some(&Value::from("id")));
        assert_eq!(err_row.get_by_name("error_codes"), Some(&Value::from("NEGATIVE")));
    }

    #[test]
    fn test_errored_input_skips_flush_and_fails() {
        let (runner, h) = runner(Box::new(Blocking::default()), RowErrorPolicy::Fail);
        let s = schema();
        h.input.put(row(&s, 1)).unwrap();
        h.input.mark_errored();
        let stats = runner.run();
        assert_eq!(stats.state, StepState::Error);
        assert_eq!(stats.rows_read, 1);
        assert_eq!(stats.rows_written, 0);
        assert!(stats.error_message.unwrap().contains("UPSTREAM_FAILED"));
        assert!(h.output.is_errored());
        assert!(drain(&h.output).is_empty());
        assert!(h.signal.is_stopped());
    }

    #[test]
    fn test_panic_becomes_step_error() {
        let (runner, h) = runner(Box::new(Checked), RowErrorPolicy::Fail);
        feed(&h.input, &[1, 99]);
        let stats = runner.run();
        assert_eq!(stats.state, StepState::Error);
        assert!(stats.error_message.unwrap().contains("boom"));
        assert!(h.output.is_errored());
    }

    #[test]
    fn test_flow_stop_abandons_input() {
        let (runner, h) = runner(Box::new(TakeTwo { seen: 0 }), RowErrorPolicy::Fail);
        feed(&h.input, &[1, 2, 3, 4]);
        let stats = runner.run();
        assert_eq!(stats.state, StepState::Finished);
        assert!(!stats.stopped);
        assert_eq!(stats.rows_written, 2);
        assert_eq!(stats.rows_discarded, 2);
        assert!(h.input.is_abandoned());
    }

    #[test]
    fn test_external_stop_ends_blocked_runner() {
        let (runner, h) = runner(Box::new(Checked), RowErrorPolicy::Fail);
        let handle = thread::spawn(move || runner.run());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.control.state(), StepState::Running);
        h.control.request_stop();
        let stats = handle.join().unwrap();
        assert!(stats.stopped);
        assert_eq!(stats.state, StepState::Finished);
        assert!(h.output.is_done());
    }

    #[test]
    fn test_stop_signal_first_reason_wins() {
        let signal = StopSignal::new();
        assert!(signal.stop("first"));
        assert!(!signal.stop("second"));
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_distribute_hops_share_rows() {
        let s = schema();
        let a = Arc::new(RowChannel::new("a", 8));
        let b = Arc::new(RowChannel::new("b", 8));
        let c = Arc::new(RowChannel::new("c", 8));
        let mut set = OutputSet::new(vec![
            OutputHop::new(FanPolicy::Copy, vec![Arc::clone(&a)]),
            OutputHop::new(FanPolicy::Distribute, vec![Arc::clone(&b)]),
            OutputHop::new(FanPolicy::Distribute, vec![Arc::clone(&c)]),
        ]);
        for id in 0..4 {
            for target in set.route() {
                target.put(row(&s, id)).unwrap();
            }
        }
        assert_eq!(a.size(), 4);
        assert_eq!(b.size(), 2);
        assert_eq!(c.size(), 2);
    }

    #[test]
    fn test_round_robin_skips_abandoned_copy() {
        let a = Arc::new(RowChannel::new("a", 8));
        let b = Arc::new(RowChannel::new("b", 8));
        let mut hop = OutputHop::new(FanPolicy::Copy, vec![Arc::clone(&a), Arc::clone(&b)]);
        a.abandon();
        for _ in 0..3 {
            assert_eq!(hop.next_target().unwrap().name(), "b");
        }
    }

    #[test]
    fn test_sequential_input_drains_in_order() {
        let s = schema();
        let first = Arc::new(RowChannel::new("first", 8));
        let second = Arc::new(RowChannel::new("second", 8));
        second.put(row(&s, 10)).unwrap();
        second.mark_done();
        first.put(row(&s, 1)).unwrap();
        first.put(row(&s, 2)).unwrap();
        first.mark_done();

        let mut inputs = InputSet::new(vec![first, second], InputPolicy::Sequential);
        let mut ids = Vec::new();
        loop {
            match inputs.next(Duration::from_millis(1)) {
                Next::Row(r) => ids.push(id_of(&r)),
                Next::Pending => {}
                Next::Exhausted => break,
            }
        }
        assert_eq!(ids, vec![1, 2, 10]);
    }

    #[test]
    fn test_round_robin_input_interleaves() {
        let s = schema();
        let first = Arc::new(RowChannel::new("first", 8));
        let second = Arc::new(RowChannel::new("second", 8));
        for id in [1, 2] {
            first.put(row(&s, id)).unwrap();
        }
        for id in [10, 20] {
            second.put(row(&s, id)).unwrap();
        }
        first.mark_done();
        second.mark_done();

        let mut inputs = InputSet::new(vec![first, second], InputPolicy::RoundRobin);
        let mut ids = Vec::new();
        loop {
            match inputs.next(Duration::from_millis(1)) {
                Next::Row(r) => ids.push(id_of(&r)),
                Next::Pending => {}
                Next::Exhausted => break,
            }
        }
        assert_eq!(ids, vec![1, 10, 2, 20]);
    }

    #[test]
    fn test_error_schema_layout() {
        let layout = error_schema(&schema());
        let names: Vec<&str> = layout.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["id", "error_count", "error_description", "error_fields", "error_codes"]
        );
    }
}
