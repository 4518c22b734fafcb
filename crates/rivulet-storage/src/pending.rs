//! Pending entry ledger
//!
//! Per-group table of delivered-but-unacknowledged entries. The ledger is a
//! `BTreeMap` keyed by entry id, so an id maps to at most one
//! [`PendingRecord`] and therefore to exactly one owning consumer.

use std::collections::BTreeMap;
use std::ops::Bound::{Included, Unbounded};
use std::time::Duration;

use rivulet_core::StreamId;
use serde::{Deserialize, Serialize};

/// One in-flight delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    /// Id of the delivered entry
    pub entry_id: StreamId,
    /// Consumer currently responsible for the entry
    pub owner: String,
    /// Times the entry has been handed out (>= 1)
    pub delivery_count: u64,
    /// When it was last handed out (Unix millis)
    pub last_delivery_ms: u64,
}

impl PendingRecord {
    /// Create a record for a first delivery
    pub fn new(entry_id: StreamId, owner: impl Into<String>, now_ms: u64) -> Self {
        Self {
            entry_id,
            owner: owner.into(),
            delivery_count: 1,
            last_delivery_ms: now_ms,
        }
    }

    /// Time since the last delivery
    pub fn idle(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_delivery_ms))
    }

    /// Whether the record has been idle for at least `min_idle`
    pub fn is_idle(&self, min_idle: Duration, now_ms: u64) -> bool {
        self.idle(now_ms) >= min_idle
    }
}

/// Aggregate view of a group's ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSummary {
    /// Number of pending records
    pub total: usize,
    /// Smallest pending id
    pub min_id: Option<StreamId>,
    /// Largest pending id
    pub max_id: Option<StreamId>,
    /// `(consumer, count)` pairs, sorted by consumer name
    pub per_consumer: Vec<(String, usize)>,
}

/// Filter for listing pending records
#[derive(Debug, Clone)]
pub struct PendingQuery {
    /// Lowest id to include
    pub start: StreamId,
    /// Highest id to include
    pub end: StreamId,
    /// Maximum records to return
    pub limit: Option<usize>,
    /// Only records owned by this consumer
    pub consumer: Option<String>,
    /// Only records idle for at least this long
    pub min_idle: Option<Duration>,
}

impl Default for PendingQuery {
    fn default() -> Self {
        Self {
            start: StreamId::MIN,
            end: StreamId::MAX,
            limit: None,
            consumer: None,
            min_idle: None,
        }
    }
}

impl PendingQuery {
    /// Create a query over the whole ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to an id range (inclusive)
    pub fn range(mut self, start: StreamId, end: StreamId) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Limit the number of results
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Only records owned by `consumer`
    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    /// Only records idle for at least `min_idle`
    pub fn min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = Some(min_idle);
        self
    }
}

/// Outcome of scanning the ledger from a cursor
#[derive(Debug, Clone, Default)]
pub struct LedgerScan {
    /// Idle records selected, ascending
    pub selected: Vec<StreamId>,
    /// Where the next scan should start; `0-0` once the end was reached
    pub next_cursor: StreamId,
}

/// Ledger of pending records for one consumer group
#[derive(Debug, Clone, Default)]
pub struct PendingLedger {
    records: BTreeMap<StreamId, PendingRecord>,
}

impl PendingLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record for an entry, if pending
    pub fn get(&self, id: StreamId) -> Option<&PendingRecord> {
        self.records.get(&id)
    }

    /// Iterate over records, ascending by entry id
    pub fn iter(&self) -> impl Iterator<Item = &PendingRecord> {
        self.records.values()
    }

    /// Register a fresh delivery.
    ///
    /// An existing record for the same id (the group cursor was moved back
    /// and the entry served again) is replaced, so the one-record-per-id
    /// rule holds.
    pub fn record_delivery(&mut self, id: StreamId, owner: &str, now_ms: u64) {
        self.records.insert(id, PendingRecord::new(id, owner, now_ms));
    }

    /// Hand a pending record to `owner`, counting it as a new delivery
    pub fn claim(&mut self, id: StreamId, owner: &str, now_ms: u64) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.owner = owner.to_string();
                record.delivery_count += 1;
                record.last_delivery_ms = now_ms;
                true
            }
            None => false,
        }
    }

    /// Count a redelivery to the current owner
    pub fn redeliver(&mut self, id: StreamId, now_ms: u64) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.delivery_count += 1;
                record.last_delivery_ms = now_ms;
                true
            }
            None => false,
        }
    }

    /// Move ownership without counting a delivery (consumer removal)
    pub fn transfer(&mut self, id: StreamId, owner: &str, now_ms: u64) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.owner = owner.to_string();
                record.last_delivery_ms = now_ms;
                true
            }
            None => false,
        }
    }

    /// Put back a record verbatim (journal compaction)
    pub fn restore(&mut self, record: PendingRecord) {
        self.records.insert(record.entry_id, record);
    }

    /// Acknowledge one id; `false` when it was not pending
    pub fn remove(&mut self, id: StreamId) -> bool {
        self.records.remove(&id).is_some()
    }

    /// Ids owned by `consumer`, ascending
    pub fn owned_by(&self, consumer: &str) -> Vec<StreamId> {
        self.records
            .values()
            .filter(|r| r.owner == consumer)
            .map(|r| r.entry_id)
            .collect()
    }

    /// Number of records owned by `consumer`
    pub fn count_for(&self, consumer: &str) -> usize {
        self.records.values().filter(|r| r.owner == consumer).count()
    }

    /// Aggregate counts
    pub fn summary(&self) -> PendingSummary {
        let mut per_consumer: BTreeMap<&str, usize> = BTreeMap::new();
        for record in self.records.values() {
            *per_consumer.entry(record.owner.as_str()).or_default() += 1;
        }
        PendingSummary {
            total: self.records.len(),
            min_id: self.records.keys().next().copied(),
            max_id: self.records.keys().next_back().copied(),
            per_consumer: per_consumer
                .into_iter()
                .map(|(name, count)| (name.to_string(), count))
                .collect(),
        }
    }

    /// Records matching `query`, ascending by entry id
    pub fn list(&self, query: &PendingQuery, now_ms: u64) -> Vec<PendingRecord> {
        if query.start > query.end {
            return Vec::new();
        }
        self.records
            .range((Included(query.start), Included(query.end)))
            .map(|(_, record)| record)
            .filter(|r| query.consumer.as_deref().is_none_or(|c| r.owner == c))
            .filter(|r| query.min_idle.is_none_or(|idle| r.is_idle(idle, now_ms)))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Walk the ledger from `cursor`, selecting up to `limit` idle records.
    ///
    /// At most `max_scan` records are examined. The returned cursor is the
    /// successor of the last record examined, whether or not it was
    /// selected, so repeated scans cover the whole ledger even when most
    /// records are skipped.
    pub fn scan_idle(
        &self,
        cursor: StreamId,
        min_idle: Duration,
        limit: usize,
        max_scan: usize,
        now_ms: u64,
    ) -> LedgerScan {
        let mut scan = LedgerScan::default();
        let mut last_examined = None;
        let mut iter = self.records.range((Included(cursor), Unbounded)).peekable();

        let mut examined = 0;
        while scan.selected.len() < limit && examined < max_scan {
            let Some((id, record)) = iter.next() else {
                break;
            };
            examined += 1;
            last_examined = Some(*id);
            if record.is_idle(min_idle, now_ms) {
                scan.selected.push(*id);
            }
        }

        scan.next_cursor = match (last_examined, iter.peek()) {
            (Some(last), Some(_)) => last.successor().unwrap_or(StreamId::MIN),
            // Stopped before examining anything (limit or scan budget of 0)
            (None, Some(_)) => cursor,
            (_, None) => StreamId::MIN,
        };
        scan
    }
}
