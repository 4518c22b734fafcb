//! Per-stream state machine
//!
//! [`StreamState`] bundles a stream's log with its consumer groups. Every
//! mutation happens in two steps:
//!
//! - **plan**: inspect current state and the caller's request, decide what
//!   happens, and return the resulting [`StreamOp`] (or `None` when nothing
//!   changes) together with the caller-facing result
//! - **apply**: mutate state from the op alone
//!
//! The broker journals the planned op between those steps, so a crash
//! never leaves memory ahead of the journal, and [`rebuild`] reproduces
//! the exact same state from the journal on startup.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use rivulet_core::{Entry, Fields, IdSpec, StreamError, StreamId, StreamResult};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::consumer_group::{ConsumerGroup, ConsumerInfo, GroupInfo, GroupStart};
use crate::ops::{JournalRecord, StreamOp};
use crate::pending::{PendingQuery, PendingRecord, PendingSummary};
use crate::stream_log::{StreamLog, TrimStrategy};

/// Scan budget multiplier for auto-claim: at most `limit * 10` records are
/// examined per call
pub const AUTO_CLAIM_SCAN_FACTOR: usize = 10;

/// Result of an explicit claim
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResult {
    /// Entries now owned by the claiming consumer
    pub claimed: Vec<Entry>,
    /// Pending ids whose entry no longer exists; dropped from the ledger
    pub deleted: Vec<StreamId>,
}

/// Result of one auto-claim step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoClaimResult {
    /// Entries now owned by the claiming consumer
    pub claimed: Vec<Entry>,
    /// Pending ids whose entry no longer exists; dropped from the ledger
    pub deleted: Vec<StreamId>,
    /// Cursor for the next call; `0-0` when the sweep reached the end
    pub next_cursor: StreamId,
}

/// One item of a pending-history read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    /// The entry is still in the log
    Entry(Entry),
    /// The entry was deleted or trimmed while pending
    Deleted(StreamId),
}

impl Delivery {
    /// Id of the delivered entry
    pub fn id(&self) -> StreamId {
        match self {
            Self::Entry(entry) => entry.id,
            Self::Deleted(id) => *id,
        }
    }
}

/// Inspection view of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub length: usize,
    pub last_id: StreamId,
    pub entries_added: u64,
    pub max_deleted_id: StreamId,
    pub first_entry: Option<Entry>,
    pub last_entry: Option<Entry>,
    pub groups: usize,
}

/// A stream's log plus its consumer groups
#[derive(Debug, Clone)]
pub struct StreamState {
    name: String,
    log: StreamLog,
    groups: BTreeMap<String, ConsumerGroup>,
}

impl StreamState {
    /// Create an empty stream
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log: StreamLog::new(),
            groups: BTreeMap::new(),
        }
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entry log
    pub fn log(&self) -> &StreamLog {
        &self.log
    }

    /// A group by name
    pub fn group(&self, group: &str) -> StreamResult<&ConsumerGroup> {
        self.groups
            .get(group)
            .ok_or_else(|| StreamError::group_not_found(&self.name, group))
    }

    fn group_mut(&mut self, group: &str) -> StreamResult<&mut ConsumerGroup> {
        let stream = &self.name;
        self.groups
            .get_mut(group)
            .ok_or_else(|| StreamError::group_not_found(stream, group))
    }

    /// Inspection summary
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            length: self.log.len(),
            last_id: self.log.last_id(),
            entries_added: self.log.entries_added(),
            max_deleted_id: self.log.max_deleted_id(),
            first_entry: self.log.first_entry(),
            last_entry: self.log.last_entry(),
            groups: self.groups.len(),
        }
    }

    /// All groups, sorted by name
    pub fn group_infos(&self) -> Vec<GroupInfo> {
        self.groups.values().map(ConsumerGroup::info).collect()
    }

    /// Consumers of a group
    pub fn consumer_infos(&self, group: &str, now_ms: u64) -> StreamResult<Vec<ConsumerInfo>> {
        Ok(self.group(group)?.consumer_infos(now_ms))
    }

    /// Aggregate view of a group's ledger
    pub fn pending_summary(&self, group: &str) -> StreamResult<PendingSummary> {
        Ok(self.group(group)?.pending().summary())
    }

    /// Pending records of a group matching `query`
    pub fn list_pending(
        &self,
        group: &str,
        query: &PendingQuery,
        now_ms: u64,
    ) -> StreamResult<Vec<PendingRecord>> {
        Ok(self.group(group)?.pending().list(query, now_ms))
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Validate fields and resolve the id of a new entry
    pub fn plan_append(
        &self,
        spec: IdSpec,
        fields: Fields,
        now_ms: u64,
    ) -> StreamResult<(StreamOp, StreamId)> {
        fields.validate()?;
        let id = self.log.resolve_id(spec, now_ms)?;
        Ok((StreamOp::Append { id, fields }, id))
    }

    /// Delete specific entries; pending records are left in place
    pub fn plan_delete(&self, ids: &[StreamId]) -> (Option<StreamOp>, usize) {
        let existing: BTreeSet<StreamId> = ids
            .iter()
            .copied()
            .filter(|id| self.log.contains(*id))
            .collect();
        if existing.is_empty() {
            return (None, 0);
        }
        let count = existing.len();
        let op = StreamOp::Delete {
            ids: existing.into_iter().collect(),
        };
        (Some(op), count)
    }

    /// Resolve a trim to the first surviving id
    pub fn plan_trim(&self, strategy: TrimStrategy) -> (Option<StreamOp>, usize) {
        match self.log.trim_floor(strategy) {
            Some(first_kept) => {
                let count = self.log.count_below(first_kept);
                (Some(StreamOp::Trim { first_kept }), count)
            }
            None => (None, 0),
        }
    }

    /// Create a group positioned per `start`
    pub fn plan_create_group(&self, group: &str, start: GroupStart) -> StreamResult<StreamOp> {
        if self.groups.contains_key(group) {
            return Err(StreamError::GroupExists(group.to_string()));
        }
        Ok(StreamOp::CreateGroup {
            group: group.to_string(),
            last_delivered_id: self.resolve_start(start),
        })
    }

    /// Destroy a group; `None` when it does not exist
    pub fn plan_destroy_group(&self, group: &str) -> Option<StreamOp> {
        self.groups
            .contains_key(group)
            .then(|| StreamOp::DestroyGroup {
                group: group.to_string(),
            })
    }

    /// Move a group's cursor
    pub fn plan_set_cursor(&self, group: &str, start: GroupStart) -> StreamResult<StreamOp> {
        self.group(group)?;
        Ok(StreamOp::SetGroupCursor {
            group: group.to_string(),
            id: self.resolve_start(start),
        })
    }

    /// Register a consumer; `None` when it is already registered
    pub fn plan_create_consumer(
        &self,
        group: &str,
        consumer: &str,
        now_ms: u64,
    ) -> StreamResult<Option<StreamOp>> {
        if self.group(group)?.has_consumer(consumer) {
            return Ok(None);
        }
        Ok(Some(StreamOp::CreateConsumer {
            group: group.to_string(),
            consumer: consumer.to_string(),
            at_ms: now_ms,
        }))
    }

    /// Deregister a consumer, returning how many records it owned
    pub fn plan_remove_consumer(
        &self,
        group: &str,
        consumer: &str,
        reassign_to: Option<&str>,
        now_ms: u64,
    ) -> StreamResult<(StreamOp, usize)> {
        let g = self.group(group)?;
        let owned = g.pending().count_for(consumer);
        if !g.has_consumer(consumer) && owned == 0 {
            return Err(StreamError::ConsumerNotFound {
                group: group.to_string(),
                consumer: consumer.to_string(),
            });
        }
        let op = StreamOp::RemoveConsumer {
            group: group.to_string(),
            consumer: consumer.to_string(),
            // Handing records back to the departing consumer would keep them
            // with nobody
            reassign_to: reassign_to
                .filter(|target| *target != consumer)
                .map(str::to_string),
            at_ms: now_ms,
        };
        Ok((op, owned))
    }

    /// Hand entries past the group cursor to `consumer`.
    ///
    /// An empty read still registers an unknown consumer, so it shows up in
    /// inspection like any other reader.
    pub fn plan_read_new(
        &self,
        group: &str,
        consumer: &str,
        count: Option<usize>,
        now_ms: u64,
    ) -> StreamResult<(Option<StreamOp>, Vec<Entry>)> {
        let g = self.group(group)?;
        let entries = self.log.entries_after(g.last_delivered_id(), count);
        if entries.is_empty() {
            let op = self.plan_create_consumer(group, consumer, now_ms)?;
            return Ok((op, entries));
        }
        let op = StreamOp::Deliver {
            group: group.to_string(),
            consumer: consumer.to_string(),
            ids: entries.iter().map(|e| e.id).collect(),
            at_ms: now_ms,
        };
        Ok((Some(op), entries))
    }

    /// Re-read entries `consumer` already owns with ids after `after`
    pub fn plan_read_pending(
        &self,
        group: &str,
        consumer: &str,
        after: StreamId,
        count: Option<usize>,
        now_ms: u64,
    ) -> StreamResult<(Option<StreamOp>, Vec<Delivery>)> {
        let g = self.group(group)?;
        let Some(start) = after.successor() else {
            return Ok((None, Vec::new()));
        };
        let mut query = PendingQuery::new()
            .range(start, StreamId::MAX)
            .consumer(consumer);
        query.limit = count;

        let deliveries: Vec<Delivery> = g
            .pending()
            .list(&query, now_ms)
            .into_iter()
            .map(|record| match self.log.get(record.entry_id) {
                Some(entry) => Delivery::Entry(entry),
                None => Delivery::Deleted(record.entry_id),
            })
            .collect();

        if deliveries.is_empty() {
            let op = self.plan_create_consumer(group, consumer, now_ms)?;
            return Ok((op, deliveries));
        }
        let op = StreamOp::Redeliver {
            group: group.to_string(),
            consumer: consumer.to_string(),
            ids: deliveries.iter().map(Delivery::id).collect(),
            at_ms: now_ms,
        };
        Ok((Some(op), deliveries))
    }

    /// Take over specific pending records that have been idle long enough.
    ///
    /// Ids that are not pending or not yet idle are skipped; duplicates in
    /// `ids` are considered once.
    pub fn plan_claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
        now_ms: u64,
    ) -> StreamResult<(Option<StreamOp>, ClaimResult)> {
        let g = self.group(group)?;
        let mut seen = HashSet::new();
        let candidates: Vec<StreamId> = ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .filter(|id| {
                g.pending()
                    .get(*id)
                    .is_some_and(|record| record.is_idle(min_idle, now_ms))
            })
            .collect();

        let (claimed, deleted) = self.split_existing(candidates);
        let result = ClaimResult { claimed, deleted };
        let op = self.claim_op(group, consumer, &result.claimed, &result.deleted, now_ms)?;
        Ok((op, result))
    }

    /// Sweep the ledger from `cursor`, claiming up to `limit` idle records
    pub fn plan_auto_claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: StreamId,
        limit: usize,
        now_ms: u64,
    ) -> StreamResult<(Option<StreamOp>, AutoClaimResult)> {
        let g = self.group(group)?;
        let scan = g.pending().scan_idle(
            cursor,
            min_idle,
            limit,
            limit.saturating_mul(AUTO_CLAIM_SCAN_FACTOR),
            now_ms,
        );

        let (claimed, deleted) = self.split_existing(scan.selected);
        let op = self.claim_op(group, consumer, &claimed, &deleted, now_ms)?;
        let result = AutoClaimResult {
            claimed,
            deleted,
            next_cursor: scan.next_cursor,
        };
        Ok((op, result))
    }

    /// Acknowledge ids, counting each pending id once
    pub fn plan_ack(
        &self,
        group: &str,
        ids: &[StreamId],
    ) -> StreamResult<(Option<StreamOp>, usize)> {
        let g = self.group(group)?;
        let pending: BTreeSet<StreamId> = ids
            .iter()
            .copied()
            .filter(|id| g.pending().get(*id).is_some())
            .collect();
        if pending.is_empty() {
            return Ok((None, 0));
        }
        let count = pending.len();
        let op = StreamOp::Ack {
            group: group.to_string(),
            ids: pending.into_iter().collect(),
        };
        Ok((Some(op), count))
    }

    fn resolve_start(&self, start: GroupStart) -> StreamId {
        match start {
            GroupStart::Beginning => StreamId::MIN,
            GroupStart::Latest => self.log.last_id(),
            GroupStart::At(id) => id,
        }
    }

    fn split_existing(&self, ids: Vec<StreamId>) -> (Vec<Entry>, Vec<StreamId>) {
        let mut claimed = Vec::new();
        let mut deleted = Vec::new();
        for id in ids {
            match self.log.get(id) {
                Some(entry) => claimed.push(entry),
                None => deleted.push(id),
            }
        }
        (claimed, deleted)
    }

    fn claim_op(
        &self,
        group: &str,
        consumer: &str,
        claimed: &[Entry],
        deleted: &[StreamId],
        now_ms: u64,
    ) -> StreamResult<Option<StreamOp>> {
        if claimed.is_empty() && deleted.is_empty() {
            return self.plan_create_consumer(group, consumer, now_ms);
        }
        Ok(Some(StreamOp::Claim {
            group: group.to_string(),
            consumer: consumer.to_string(),
            ids: claimed.iter().map(|e| e.id).collect(),
            dropped: deleted.to_vec(),
            at_ms: now_ms,
        }))
    }

    // ========================================================================
    // Applying
    // ========================================================================

    /// Apply a planned or replayed op
    pub fn apply(&mut self, op: &StreamOp) -> StreamResult<()> {
        trace!(stream = %self.name, op = op.kind(), "Applying op");
        match op {
            StreamOp::Append { id, fields } => self.log.insert(*id, fields.clone())?,
            StreamOp::Delete { ids } => {
                self.log.delete(ids);
            }
            StreamOp::Trim { first_kept } => {
                self.log.trim_to(*first_kept);
            }
            StreamOp::CreateGroup {
                group,
                last_delivered_id,
            } => {
                if self.groups.contains_key(group) {
                    return Err(StreamError::GroupExists(group.clone()));
                }
                self.groups
                    .insert(group.clone(), ConsumerGroup::new(group, *last_delivered_id));
            }
            StreamOp::DestroyGroup { group } => {
                self.groups.remove(group);
            }
            StreamOp::SetGroupCursor { group, id } => {
                self.group_mut(group)?.set_last_delivered_id(*id);
            }
            StreamOp::CreateConsumer {
                group,
                consumer,
                at_ms,
            } => {
                self.group_mut(group)?.touch_consumer(consumer, *at_ms);
            }
            StreamOp::RemoveConsumer {
                group,
                consumer,
                reassign_to,
                at_ms,
            } => {
                let g = self.group_mut(group)?;
                if let Some(target) = reassign_to {
                    g.touch_consumer(target, *at_ms);
                    for id in g.pending().owned_by(consumer) {
                        g.pending_mut().transfer(id, target, *at_ms);
                    }
                }
                g.remove_consumer(consumer);
            }
            StreamOp::Deliver {
                group,
                consumer,
                ids,
                at_ms,
            } => {
                let g = self.group_mut(group)?;
                g.touch_consumer(consumer, *at_ms);
                for id in ids {
                    g.pending_mut().record_delivery(*id, consumer, *at_ms);
                }
                if let Some(last) = ids.iter().max() {
                    g.advance_cursor(*last);
                }
            }
            StreamOp::Redeliver {
                group,
                consumer,
                ids,
                at_ms,
            } => {
                let g = self.group_mut(group)?;
                g.touch_consumer(consumer, *at_ms);
                for id in ids {
                    g.pending_mut().redeliver(*id, *at_ms);
                }
            }
            StreamOp::Claim {
                group,
                consumer,
                ids,
                dropped,
                at_ms,
            } => {
                let g = self.group_mut(group)?;
                g.touch_consumer(consumer, *at_ms);
                for id in ids {
                    g.pending_mut().claim(*id, consumer, *at_ms);
                }
                for id in dropped {
                    g.pending_mut().remove(*id);
                }
            }
            StreamOp::Ack { group, ids } => {
                let g = self.group_mut(group)?;
                for id in ids {
                    g.pending_mut().remove(*id);
                }
            }
            StreamOp::RestoreMeta {
                last_id,
                entries_added,
                max_deleted_id,
            } => {
                self.log
                    .restore_meta(*last_id, *entries_added, *max_deleted_id);
            }
            StreamOp::RestorePending { group, record } => {
                self.group_mut(group)?.pending_mut().restore(record.clone());
            }
            StreamOp::DeleteStream => {
                self.log = StreamLog::new();
                self.groups.clear();
            }
        }
        Ok(())
    }

    /// Minimal op sequence that rebuilds this stream from nothing
    pub fn snapshot_ops(&self) -> Vec<StreamOp> {
        let mut ops: Vec<StreamOp> = self
            .log
            .iter()
            .map(|entry| StreamOp::Append {
                id: entry.id,
                fields: entry.fields,
            })
            .collect();

        ops.push(StreamOp::RestoreMeta {
            last_id: self.log.last_id(),
            entries_added: self.log.entries_added(),
            max_deleted_id: self.log.max_deleted_id(),
        });

        for group in self.groups.values() {
            ops.push(StreamOp::CreateGroup {
                group: group.name().to_string(),
                last_delivered_id: group.last_delivered_id(),
            });
            ops.extend(group.consumers().map(|c| StreamOp::CreateConsumer {
                group: group.name().to_string(),
                consumer: c.name.clone(),
                at_ms: c.seen_ms,
            }));
            ops.extend(group.pending().iter().map(|record| StreamOp::RestorePending {
                group: group.name().to_string(),
                record: record.clone(),
            }));
        }
        ops
    }
}

/// Rebuild every stream from journal records, in order.
///
/// Records that fail to apply are logged and skipped; the remaining
/// history still loads.
pub fn rebuild(records: impl IntoIterator<Item = JournalRecord>) -> BTreeMap<String, StreamState> {
    let mut streams: BTreeMap<String, StreamState> = BTreeMap::new();
    for record in records {
        if matches!(record.op, StreamOp::DeleteStream) {
            streams.remove(&record.stream);
            continue;
        }
        let state = streams
            .entry(record.stream.clone())
            .or_insert_with(|| StreamState::new(&record.stream));
        if let Err(e) = state.apply(&record.op) {
            warn!(
                stream = %record.stream,
                op = record.op.kind(),
                error = %e,
                "Skipping journal record that does not apply"
            );
        }
    }
    streams
}
