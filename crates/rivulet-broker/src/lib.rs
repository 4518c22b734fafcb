//! # Rivulet Broker
//!
//! Embeddable append-only stream engine with consumer groups.
//!
//! ## Features
//!
//! - **Streams**: Append, forward/backward range queries, delete, trim
//! - **Consumer groups**: Independently cursored fan-out with exclusive
//!   delivery among a group's consumers
//! - **Pending entry ledger**: Per-group ownership, delivery counts and
//!   idle times of unacknowledged entries
//! - **Claiming**: Explicit claim and cursor-driven auto-claim of idle
//!   entries
//! - **Blocking reads**: Wait for new entries without holding any lock
//! - **Durability**: Every mutation is journaled before it is applied and
//!   replayed on open
//! - **ReclaimTask**: Cancellable background loop that recovers entries
//!   abandoned by crashed consumers
//!
//! ## Concurrency
//!
//! Each stream sits behind its own async mutex. A mutation plans its
//! [`StreamOp`](rivulet_storage::StreamOp) under that lock, writes it to the
//! journal, then applies it, so id assignment, cursor advancement and
//! ledger updates are atomic per stream. Compaction takes a broker-wide
//! write barrier that every mutation holds shared.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use rivulet_broker::{Broker, ReadOptions};
//! use rivulet_core::{Fields, StreamId};
//! use rivulet_storage::GroupStart;
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = Broker::in_memory(Default::default());
//!
//!     broker.append("orders", Fields::new().with("sku", "42")).await.unwrap();
//!     broker.create_group("orders", "billing", GroupStart::Beginning, false).await.unwrap();
//!
//!     let entries = broker
//!         .read_new("orders", "billing", "worker-1", ReadOptions::new().count(10))
//!         .await
//!         .unwrap();
//!     let ids: Vec<StreamId> = entries.iter().map(|e| e.id).collect();
//!     broker.ack("orders", "billing", &ids).await.unwrap();
//! }
//! ```

pub mod config;
pub mod reclaim;

pub use config::{BrokerConfig, ConsumerRemovalPolicy};
pub use reclaim::{
    HandlerError, IdempotentHandler, ReclaimConfig, ReclaimHandler, ReclaimTask, SweepReport,
};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rivulet_core::{Clock, Entry, Fields, IdSpec, StreamError, StreamId, StreamResult, SystemClock};
use rivulet_storage::{
    AutoClaimResult, ClaimResult, ConsumerInfo, Delivery, FileJournal, GroupInfo, GroupStart,
    Journal, JournalRecord, MemoryJournal, PendingQuery, PendingRecord, PendingSummary, StreamInfo,
    StreamOp, StreamState, TrimStrategy, rebuild,
};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Options for [`Broker::read_new`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Maximum entries to return; `None` means no limit and `Some(0)`
    /// delivers nothing
    pub count: Option<usize>,
    /// How long to wait for new entries; `None` returns immediately
    pub block: Option<Duration>,
}

impl ReadOptions {
    /// Non-blocking, unbounded read
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of entries
    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Wait up to `block` for new entries
    pub fn block(mut self, block: Duration) -> Self {
        self.block = Some(block);
        self
    }
}

/// One stream's state plus the wake-up signal for blocked readers
#[derive(Debug)]
struct StreamHandle {
    /// `None` once the stream has been deleted
    state: Arc<Mutex<Option<StreamState>>>,
    /// Notified after appends and other changes blocked readers care about
    appended: Notify,
}

impl StreamHandle {
    fn new(name: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(Some(StreamState::new(name)))),
            appended: Notify::new(),
        }
    }

    fn from_state(state: StreamState) -> Self {
        Self {
            state: Arc::new(Mutex::new(Some(state))),
            appended: Notify::new(),
        }
    }
}

type StreamGuard = OwnedMutexGuard<Option<StreamState>>;

/// The stream engine
#[derive(Debug)]
pub struct Broker {
    streams: DashMap<String, Arc<StreamHandle>>,
    /// Held shared by mutations, exclusively by compaction
    barrier: RwLock<()>,
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
    config: BrokerConfig,
}

impl Broker {
    /// Open a broker per `config`, replaying its journal
    pub async fn open(config: BrokerConfig, clock: Arc<dyn Clock>) -> StreamResult<Self> {
        let journal: Arc<dyn Journal> = match &config.data_dir {
            Some(dir) => Arc::new(FileJournal::with_options(dir, config.sync_writes).await?),
            None => Arc::new(MemoryJournal::new()),
        };
        Self::with_parts(config, journal, clock).await
    }

    /// Open over an explicit journal, replaying it
    pub async fn with_parts(
        config: BrokerConfig,
        journal: Arc<dyn Journal>,
        clock: Arc<dyn Clock>,
    ) -> StreamResult<Self> {
        let records = journal.replay().await?;
        let record_count = records.len();
        let streams: DashMap<String, Arc<StreamHandle>> = rebuild(records)
            .into_iter()
            .map(|(name, state)| (name, Arc::new(StreamHandle::from_state(state))))
            .collect();

        info!(
            records = record_count,
            streams = streams.len(),
            "Broker opened"
        );

        Ok(Self {
            streams,
            barrier: RwLock::new(()),
            journal,
            clock,
            config,
        })
    }

    /// In-memory broker on the system clock
    pub fn in_memory(config: BrokerConfig) -> Self {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    /// In-memory broker on an explicit clock
    pub fn in_memory_with_clock(config: BrokerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: DashMap::new(),
            barrier: RwLock::new(()),
            journal: Arc::new(MemoryJournal::new()),
            clock,
            config,
        }
    }

    /// Broker configuration
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Current time per the broker's clock (Unix millis)
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Names of all streams, sorted
    pub fn streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ========================================================================
    // Stream log
    // ========================================================================

    /// Append an entry with an auto-generated id, creating the stream if
    /// needed
    pub async fn append(&self, stream: &str, fields: Fields) -> StreamResult<StreamId> {
        self.append_with_id(stream, IdSpec::Auto, fields).await
    }

    /// Append an entry with an explicit or partial id
    #[instrument(level = "debug", skip(self, fields), fields(field_count = fields.len()))]
    pub async fn append_with_id(
        &self,
        stream: &str,
        spec: IdSpec,
        fields: Fields,
    ) -> StreamResult<StreamId> {
        self.mutate(stream, true, |state, now| {
            let (op, id) = state.plan_append(spec, fields, now)?;
            Ok((Some(op), id))
        })
        .await
    }

    /// Entries with `start <= id <= end`, ascending
    pub async fn range_forward(
        &self,
        stream: &str,
        start: StreamId,
        end: StreamId,
        limit: Option<usize>,
    ) -> StreamResult<Vec<Entry>> {
        self.inspect(stream, |state| Ok(state.log().range_forward(start, end, limit)))
            .await
    }

    /// Entries with `start <= id <= end`, descending from `end`
    pub async fn range_backward(
        &self,
        stream: &str,
        end: StreamId,
        start: StreamId,
        limit: Option<usize>,
    ) -> StreamResult<Vec<Entry>> {
        self.inspect(stream, |state| Ok(state.log().range_backward(end, start, limit)))
            .await
    }

    /// Remove entries, returning how many existed.
    ///
    /// Pending records for deleted entries stay in the ledgers until they
    /// are acknowledged or claimed.
    #[instrument(level = "debug", skip(self, ids), fields(ids = ids.len()))]
    pub async fn delete(&self, stream: &str, ids: &[StreamId]) -> StreamResult<usize> {
        self.mutate(stream, false, |state, _| Ok(state.plan_delete(ids)))
            .await
    }

    /// Remove the oldest entries, returning how many went
    #[instrument(level = "debug", skip(self))]
    pub async fn trim(&self, stream: &str, strategy: TrimStrategy) -> StreamResult<usize> {
        self.mutate(stream, false, |state, _| Ok(state.plan_trim(strategy)))
            .await
    }

    /// Drop a stream with all its groups; `false` if it did not exist
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_stream(&self, stream: &str) -> StreamResult<bool> {
        let _barrier = self.barrier.read().await;
        let Some(handle) = self.streams.get(stream).map(|h| Arc::clone(h.value())) else {
            return Ok(false);
        };
        let mut guard = Arc::clone(&handle.state).lock_owned().await;
        if guard.is_none() {
            return Ok(false);
        }

        self.journal
            .append(&JournalRecord::new(stream, StreamOp::DeleteStream))
            .await?;
        *guard = None;
        drop(guard);
        self.streams.remove_if(stream, |_, h| Arc::ptr_eq(h, &handle));
        handle.appended.notify_waiters();

        info!(stream, "Stream deleted");
        Ok(true)
    }

    /// Inspection summary of a stream
    pub async fn info(&self, stream: &str) -> StreamResult<StreamInfo> {
        self.inspect(stream, |state| Ok(state.info())).await
    }

    // ========================================================================
    // Consumer groups
    // ========================================================================

    /// Create a group.
    ///
    /// With `mkstream` a missing stream is created empty; otherwise it is
    /// `StreamNotFound`. An existing group is `GroupExists`.
    #[instrument(level = "debug", skip(self))]
    pub async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> StreamResult<()> {
        self.mutate(stream, mkstream, |state, _| {
            let op = state.plan_create_group(group, start)?;
            Ok((Some(op), ()))
        })
        .await
    }

    /// Create a group unless it already exists; `true` if it was created
    pub async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> StreamResult<bool> {
        match self.create_group(stream, group, start, mkstream).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_benign() => {
                debug!(stream, group, "Group already exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Destroy a group with its pending records; `false` if it did not exist
    #[instrument(level = "debug", skip(self))]
    pub async fn destroy_group(&self, stream: &str, group: &str) -> StreamResult<bool> {
        self.mutate(stream, false, |state, _| {
            let op = state.plan_destroy_group(group);
            let existed = op.is_some();
            Ok((op, existed))
        })
        .await
    }

    /// Reposition a group's cursor; pending records are untouched
    #[instrument(level = "debug", skip(self))]
    pub async fn set_group_cursor(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> StreamResult<()> {
        self.mutate(stream, false, |state, _| {
            let op = state.plan_set_cursor(group, start)?;
            Ok((Some(op), ()))
        })
        .await
    }

    /// All groups of a stream
    pub async fn groups(&self, stream: &str) -> StreamResult<Vec<GroupInfo>> {
        self.inspect(stream, |state| Ok(state.group_infos())).await
    }

    /// Consumers of a group
    pub async fn consumers(&self, stream: &str, group: &str) -> StreamResult<Vec<ConsumerInfo>> {
        let now = self.clock.now_ms();
        self.inspect(stream, |state| state.consumer_infos(group, now))
            .await
    }

    /// Register a consumer; `true` if it was new
    #[instrument(level = "debug", skip(self))]
    pub async fn create_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StreamResult<bool> {
        self.mutate(stream, false, |state, now| {
            let op = state.plan_create_consumer(group, consumer, now)?;
            let created = op.is_some();
            Ok((op, created))
        })
        .await
    }

    /// Remove a consumer under the configured removal policy, returning how
    /// many pending records it owned
    pub async fn remove_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StreamResult<usize> {
        let policy = self.config.removal_policy.clone();
        self.remove_consumer_with(stream, group, consumer, &policy)
            .await
    }

    /// Remove a consumer under an explicit removal policy
    #[instrument(level = "debug", skip(self))]
    pub async fn remove_consumer_with(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        policy: &ConsumerRemovalPolicy,
    ) -> StreamResult<usize> {
        let reassign_to = match policy {
            ConsumerRemovalPolicy::LeavePending => None,
            ConsumerRemovalPolicy::ReassignTo(target) => Some(target.as_str()),
        };
        self.mutate(stream, false, |state, now| {
            let (op, owned) = state.plan_remove_consumer(group, consumer, reassign_to, now)?;
            Ok((Some(op), owned))
        })
        .await
    }

    // ========================================================================
    // Dispatcher
    // ========================================================================

    /// Deliver entries the group has not seen yet to `consumer`.
    ///
    /// With `options.block` set and nothing new, waits (up to the configured
    /// ceiling) for an append to the stream, then returns whatever is
    /// available, possibly nothing. No lock is held while waiting.
    #[instrument(level = "debug", skip(self))]
    pub async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: ReadOptions,
    ) -> StreamResult<Vec<Entry>> {
        let count = options.count;
        let deadline = options
            .block
            .filter(|_| count != Some(0))
            .map(|block| block.min(self.config.max_block()))
            .filter(|block| !block.is_zero())
            .map(|block| Instant::now() + block);

        loop {
            let handle = self.handle(stream)?;
            let notified = handle.appended.notified();
            tokio::pin!(notified);
            // Register before reading so an append between the read and the
            // wait is not missed
            notified.as_mut().enable();

            let entries = self
                .mutate(stream, false, |state, now| {
                    state.plan_read_new(group, consumer, count, now)
                })
                .await?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            let Some(deadline) = deadline else {
                return Ok(entries);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Re-read entries `consumer` already owns with ids after `after`.
    ///
    /// Each returned record counts as a redelivery. Entries deleted from
    /// the log while pending come back as [`Delivery::Deleted`].
    #[instrument(level = "debug", skip(self))]
    pub async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: StreamId,
        count: Option<usize>,
    ) -> StreamResult<Vec<Delivery>> {
        self.mutate(stream, false, |state, now| {
            state.plan_read_pending(group, consumer, after, count, now)
        })
        .await
    }

    // ========================================================================
    // Pending entry ledger
    // ========================================================================

    /// Aggregate view of a group's pending records
    pub async fn pending(&self, stream: &str, group: &str) -> StreamResult<PendingSummary> {
        self.inspect(stream, |state| state.pending_summary(group))
            .await
    }

    /// Pending records matching `query`, ascending by entry id
    pub async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        query: &PendingQuery,
    ) -> StreamResult<Vec<PendingRecord>> {
        let now = self.clock.now_ms();
        self.inspect(stream, |state| state.list_pending(group, query, now))
            .await
    }

    /// Take over pending records idle for at least `min_idle`.
    ///
    /// Ids that are not pending or not idle enough are skipped.
    #[instrument(level = "debug", skip(self, ids), fields(ids = ids.len()))]
    pub async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> StreamResult<ClaimResult> {
        self.mutate(stream, false, |state, now| {
            state.plan_claim(group, consumer, min_idle, ids, now)
        })
        .await
    }

    /// One step of a ledger sweep from `cursor`; see [`AutoClaimResult`]
    #[instrument(level = "debug", skip(self))]
    pub async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: StreamId,
        limit: usize,
    ) -> StreamResult<AutoClaimResult> {
        if limit == 0 {
            // Still validates that the stream and group exist
            self.inspect(stream, |state| state.group(group).map(|_| ()))
                .await?;
            return Ok(AutoClaimResult {
                next_cursor: cursor,
                ..AutoClaimResult::default()
            });
        }
        self.mutate(stream, false, |state, now| {
            state.plan_auto_claim(group, consumer, min_idle, cursor, limit, now)
        })
        .await
    }

    /// Acknowledge entries, returning how many were actually pending
    #[instrument(level = "debug", skip(self, ids), fields(ids = ids.len()))]
    pub async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> StreamResult<usize> {
        self.mutate(stream, false, |state, _| state.plan_ack(group, ids))
            .await
    }

    // ========================================================================
    // Journal maintenance
    // ========================================================================

    /// Flush buffered journal writes
    pub async fn flush(&self) -> StreamResult<()> {
        Ok(self.journal.flush().await?)
    }

    /// Rewrite the journal as the shortest history reproducing current
    /// state, returning the number of records written
    pub async fn compact(&self) -> StreamResult<usize> {
        let _barrier = self.barrier.write().await;

        let mut handles: Vec<(String, Arc<StreamHandle>)> = self
            .streams
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));

        let mut records = Vec::new();
        for (name, handle) in handles {
            let guard = handle.state.lock().await;
            if let Some(state) = guard.as_ref() {
                records.extend(
                    state
                        .snapshot_ops()
                        .into_iter()
                        .map(|op| JournalRecord::new(name.as_str(), op)),
                );
            }
        }

        self.journal.rewrite(&records).await?;
        info!(records = records.len(), "Journal compacted");
        Ok(records.len())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn handle(&self, stream: &str) -> StreamResult<Arc<StreamHandle>> {
        self.streams
            .get(stream)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| StreamError::StreamNotFound(stream.to_string()))
    }

    /// Lock a live stream, creating it when `create` is set.
    ///
    /// Returns whether this call created the stream.
    async fn lock_stream(
        &self,
        stream: &str,
        create: bool,
    ) -> StreamResult<(Arc<StreamHandle>, StreamGuard, bool)> {
        loop {
            let existing = self.streams.get(stream).map(|h| Arc::clone(h.value()));
            let (handle, created) = match existing {
                Some(handle) => (handle, false),
                None if create => {
                    let mut created = false;
                    let handle = Arc::clone(
                        self.streams
                            .entry(stream.to_string())
                            .or_insert_with(|| {
                                created = true;
                                Arc::new(StreamHandle::new(stream))
                            })
                            .value(),
                    );
                    (handle, created)
                }
                None => return Err(StreamError::StreamNotFound(stream.to_string())),
            };

            let guard = Arc::clone(&handle.state).lock_owned().await;
            if guard.is_some() {
                return Ok((handle, guard, created));
            }

            // Deleted while we waited for the lock
            drop(guard);
            self.streams.remove_if(stream, |_, h| Arc::ptr_eq(h, &handle));
            if !create {
                return Err(StreamError::StreamNotFound(stream.to_string()));
            }
        }
    }

    /// Plan under the stream lock, journal, then apply.
    ///
    /// `plan` gets the current state and the clock reading for this
    /// operation, and returns the op to commit (if any) with the caller's
    /// result.
    async fn mutate<T>(
        &self,
        stream: &str,
        create: bool,
        plan: impl FnOnce(&StreamState, u64) -> StreamResult<(Option<StreamOp>, T)>,
    ) -> StreamResult<T> {
        let _barrier = self.barrier.read().await;
        let (handle, mut guard, created) = self.lock_stream(stream, create).await?;
        let Some(state) = guard.as_mut() else {
            return Err(StreamError::StreamNotFound(stream.to_string()));
        };

        let now = self.clock.now_ms();
        let (op, out) = match plan(state, now) {
            Ok((Some(op), out)) => (op, out),
            Ok((None, out)) => {
                if created {
                    self.discard(stream, &handle, guard);
                }
                return Ok(out);
            }
            Err(e) => {
                if created {
                    self.discard(stream, &handle, guard);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.journal.append(&JournalRecord::new(stream, op.clone())).await {
            if created {
                self.discard(stream, &handle, guard);
            }
            return Err(e.into());
        }
        state.apply(&op)?;
        debug!(stream, op = op.kind(), "Committed");

        if op.wakes_readers() {
            handle.appended.notify_waiters();
        }
        Ok(out)
    }

    /// Undo the creation of a stream nothing was committed to
    fn discard(&self, stream: &str, handle: &Arc<StreamHandle>, mut guard: StreamGuard) {
        *guard = None;
        drop(guard);
        self.streams.remove_if(stream, |_, h| Arc::ptr_eq(h, handle));
    }

    /// Run a read-only query against a live stream
    async fn inspect<T>(
        &self,
        stream: &str,
        query: impl FnOnce(&StreamState) -> StreamResult<T>,
    ) -> StreamResult<T> {
        let handle = self.handle(stream)?;
        let guard = handle.state.lock().await;
        match guard.as_ref() {
            Some(state) => query(state),
            None => Err(StreamError::StreamNotFound(stream.to_string())),
        }
    }
}
