//! Bounded row channel between one producer step-copy and one consumer step-copy.
//!
//! A [`RowChannel`] is a FIFO queue guarded by a `parking_lot` mutex with two
//! condition variables. Producers block while the queue is full, consumers
//! block while it is empty, and the `done` flag lets a consumer tell "nothing
//! yet" apart from "nothing ever again". A capacity of zero turns the channel
//! into a rendezvous: a put returns only once the consumer has taken the row.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use rowflow_types::{Row, Schema, SchemaRef};

/// Failure to enqueue a row.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel '{channel}' is already done")]
    Done { channel: String },
    #[error("channel '{channel}' was abandoned by its consumer")]
    Abandoned { channel: String },
    #[error("channel '{channel}' expects schema {expected} but row has {actual}")]
    SchemaMismatch {
        channel: String,
        expected: String,
        actual: String,
    },
}

/// Outcome of a bounded receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Recv {
    Row(Row),
    /// The producer finished and every row has been consumed.
    Done,
    TimedOut,
}

/// Schema shared by every channel of one hop. Declared on the hop, or
/// fixed by the first row that crosses any of its channels.
#[derive(Debug, Default)]
pub struct HopSchema {
    pinned: Mutex<Option<SchemaRef>>,
}

impl HopSchema {
    #[must_use]
    pub fn new(declared: Option<SchemaRef>) -> Arc<Self> {
        Arc::new(Self {
            pinned: Mutex::new(declared),
        })
    }

    #[must_use]
    pub fn get(&self) -> Option<SchemaRef> {
        self.pinned.lock().clone()
    }

    /// Pin `schema` if nothing is pinned yet, otherwise check it against
    /// the pinned one. The pinned schema is returned on mismatch.
    fn admit(&self, schema: &SchemaRef) -> Result<(), SchemaRef> {
        let mut pinned = self.pinned.lock();
        match pinned.as_ref() {
            Some(expected)
                if Arc::ptr_eq(expected, schema) || expected.is_compatible_with(schema) =>
            {
                Ok(())
            }
            Some(expected) => Err(Arc::clone(expected)),
            None => {
                *pinned = Some(Arc::clone(schema));
                Ok(())
            }
        }
    }
}

/// Observer of channel traffic. Called outside the queue lock, so
/// implementations may be slow without stalling the peer step, but they
/// must not call back into the same channel.
pub trait ChannelListener: Send + Sync {
    fn on_enqueue(&self, _channel: &str, _row: &Row) {}
    fn on_dequeue(&self, _channel: &str, _row: &Row) {}
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    Never,
    At(Instant),
    Now,
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Self::Never, Self::At)
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    queue: VecDeque<Row>,
    done: bool,
    errored: bool,
    abandoned: bool,
    enqueued: u64,
    dequeued: u64,
}

/// Bounded blocking FIFO of rows.
pub struct RowChannel {
    name: String,
    capacity: usize,
    schema: Arc<HopSchema>,
    state: Mutex<ChannelState>,
    not_empty: Condvar,
    not_full: Condvar,
    listeners: RwLock<Vec<Arc<dyn ChannelListener>>>,
}

impl std::fmt::Debug for RowChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RowChannel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("size", &state.queue.len())
            .field("done", &state.done)
            .field("abandoned", &state.abandoned)
            .finish_non_exhaustive()
    }
}

impl RowChannel {
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self::with_schema(name, capacity, None)
    }

    /// Create a channel that only accepts rows compatible with `schema`.
    /// Without a declared schema the first row fixes it.
    #[must_use]
    pub fn with_schema(
        name: impl Into<String>,
        capacity: usize,
        schema: Option<SchemaRef>,
    ) -> Self {
        Self::for_hop(name, capacity, HopSchema::new(schema))
    }

    /// Create one of the channels of a hop. Every channel built from the
    /// same [`HopSchema`] enforces the same layout.
    #[must_use]
    pub fn for_hop(name: impl Into<String>, capacity: usize, schema: Arc<HopSchema>) -> Self {
        Self {
            name: name.into(),
            capacity,
            schema,
            state: Mutex::new(ChannelState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.listeners.write().push(listener);
    }

    /// Enqueue `row`, blocking until there is room.
    pub fn put(&self, row: Row) -> Result<(), ChannelError> {
        self.put_until(row, Deadline::Never).map(|_| ())
    }

    /// Enqueue `row`, waiting at most `timeout`. `Ok(false)` means the row
    /// was not enqueued.
    pub fn put_wait(&self, row: Row, timeout: Duration) -> Result<bool, ChannelError> {
        self.put_until(row, Deadline::after(timeout))
    }

    /// Enqueue `row` only if there is room right now.
    pub fn try_put(&self, row: Row) -> Result<bool, ChannelError> {
        self.put_until(row, Deadline::Now)
    }

    fn put_until(&self, row: Row, deadline: Deadline) -> Result<bool, ChannelError> {
        let limit = self.capacity.max(1);
        let mut state = self.state.lock();
        loop {
            self.check_open(&state)?;
            if state.queue.len() < limit {
                break;
            }
            if !wait_on(&self.not_full, &mut state, deadline) {
                self.check_open(&state)?;
                if state.queue.len() >= limit {
                    return Ok(false);
                }
                break;
            }
        }
        self.check_schema(&row)?;

        let notify = self.snapshot_listeners();
        let observed = (!notify.is_empty()).then(|| row.clone());
        state.queue.push_back(row);
        state.enqueued += 1;
        let ticket = state.enqueued;
        self.not_empty.notify_one();
        tracing::trace!(channel = %self.name, size = state.queue.len(), "Row enqueued");

        if self.capacity == 0 && !self.await_handoff(&mut state, ticket, deadline) {
            // Timed out before the consumer arrived: withdraw the row.
            state.queue.pop_back();
            state.enqueued -= 1;
            return Ok(false);
        }
        drop(state);

        if let Some(row) = observed {
            for listener in &notify {
                listener.on_enqueue(&self.name, &row);
            }
        }
        Ok(true)
    }

    /// Rendezvous: wait until the row with sequence `ticket` was taken.
    /// Returns `false` on timeout with the row still queued.
    fn await_handoff(
        &self,
        state: &mut MutexGuard<'_, ChannelState>,
        ticket: u64,
        deadline: Deadline,
    ) -> bool {
        loop {
            // An abandoning consumer drops and counts the row itself.
            if state.dequeued >= ticket || state.abandoned {
                return true;
            }
            if !wait_on(&self.not_full, state, deadline) {
                return state.dequeued >= ticket || state.abandoned;
            }
        }
    }

    /// Dequeue the next row, blocking until one is available. `None` once the
    /// channel is done and drained.
    pub fn get(&self) -> Option<Row> {
        match self.get_until(Deadline::Never) {
            Recv::Row(row) => Some(row),
            Recv::Done | Recv::TimedOut => None,
        }
    }

    /// Dequeue the next row, waiting at most `timeout`.
    pub fn get_wait(&self, timeout: Duration) -> Recv {
        self.get_until(Deadline::after(timeout))
    }

    /// Dequeue the next row only if one is queued right now.
    pub fn try_get(&self) -> Recv {
        self.get_until(Deadline::Now)
    }

    fn get_until(&self, deadline: Deadline) -> Recv {
        let mut state = self.state.lock();
        loop {
            if let Some(row) = state.queue.pop_front() {
                state.dequeued += 1;
                // Single producer, but it may be waiting either for room or
                // for a rendezvous hand-off.
                self.not_full.notify_all();
                drop(state);
                for listener in &self.snapshot_listeners() {
                    listener.on_dequeue(&self.name, &row);
                }
                return Recv::Row(row);
            }
            if state.done || state.abandoned {
                return Recv::Done;
            }
            if !wait_on(&self.not_empty, &mut state, deadline) && state.queue.is_empty() {
                return if state.done { Recv::Done } else { Recv::TimedOut };
            }
        }
    }

    /// Signal that no more rows will be put. Idempotent.
    pub fn mark_done(&self) {
        let mut state = self.state.lock();
        if !state.done {
            state.done = true;
            tracing::debug!(channel = %self.name, enqueued = state.enqueued, "Channel done");
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Signal that the producer failed. Implies done.
    pub fn mark_errored(&self) {
        self.state.lock().errored = true;
        self.mark_done();
    }

    /// Consumer-side close. Drops every undelivered row and makes further
    /// puts fail with [`ChannelError::Abandoned`]. Returns the number of rows
    /// dropped.
    pub fn abandon(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        if !state.abandoned {
            state.abandoned = true;
            tracing::debug!(channel = %self.name, dropped, "Channel abandoned");
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
        dropped
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.state.lock().queue.len() >= self.capacity.max(1)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.state.lock().errored
    }

    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.state.lock().abandoned
    }

    /// Rows accepted so far.
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.state.lock().enqueued
    }

    /// Rows handed to the consumer so far.
    #[must_use]
    pub fn dequeued(&self) -> u64 {
        self.state.lock().dequeued
    }

    /// The schema enforced on this channel, once known.
    #[must_use]
    pub fn schema(&self) -> Option<SchemaRef> {
        self.schema.get()
    }

    fn check_open(&self, state: &ChannelState) -> Result<(), ChannelError> {
        if state.done {
            return Err(ChannelError::Done {
                channel: self.name.clone(),
            });
        }
        if state.abandoned {
            return Err(ChannelError::Abandoned {
                channel: self.name.clone(),
            });
        }
        Ok(())
    }

    fn check_schema(&self, row: &Row) -> Result<(), ChannelError> {
        self.schema
            .admit(row.schema())
            .map_err(|expected| self.mismatch(&expected, row.schema()))
    }

    fn mismatch(&self, expected: &Schema, actual: &Schema) -> ChannelError {
        ChannelError::SchemaMismatch {
            channel: self.name.clone(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn ChannelListener>> {
        self.listeners.read().clone()
    }
}

/// Wait on `cond` until notified or `deadline` passes. Returns `false`
/// when the deadline passed.
fn wait_on(cond: &Condvar, state: &mut MutexGuard<'_, ChannelState>, deadline: Deadline) -> bool {
    match deadline {
        Deadline::Never => {
            cond.wait(state);
            true
        }
        Deadline::At(at) => !cond.wait_until(state, at).timed_out(),
        Deadline::Now => false,
    }
}
