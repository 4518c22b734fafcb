//! Consumer groups
//!
//! A group is an independently cursored view over one stream. Entries past
//! `last_delivered_id` are "new" to the group; everything delivered and not
//! yet acknowledged sits in the group's [`PendingLedger`].

use std::collections::BTreeMap;

use rivulet_core::StreamId;
use serde::{Deserialize, Serialize};

use crate::pending::PendingLedger;

/// Where a new group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroupStart {
    /// Deliver everything already in the stream
    #[default]
    Beginning,
    /// Deliver only entries appended after creation
    Latest,
    /// Deliver entries after this id
    At(StreamId),
}

/// A registered consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    /// Consumer name
    pub name: String,
    /// Last read or claim attempt (Unix millis)
    pub seen_ms: u64,
}

/// Public view of a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: usize,
    pub seen_ms: u64,
    pub idle_ms: u64,
}

/// Public view of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    pub pending: usize,
    pub last_delivered_id: StreamId,
}

/// A named consumer group on a stream
#[derive(Debug, Clone)]
pub struct ConsumerGroup {
    name: String,
    last_delivered_id: StreamId,
    consumers: BTreeMap<String, Consumer>,
    pending: PendingLedger,
}

impl ConsumerGroup {
    /// Create a group with its cursor at `last_delivered_id`
    pub fn new(name: impl Into<String>, last_delivered_id: StreamId) -> Self {
        Self {
            name: name.into(),
            last_delivered_id,
            consumers: BTreeMap::new(),
            pending: PendingLedger::new(),
        }
    }

    /// Group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cursor past which entries are new to this group
    pub fn last_delivered_id(&self) -> StreamId {
        self.last_delivered_id
    }

    /// Reposition the cursor
    pub fn set_last_delivered_id(&mut self, id: StreamId) {
        self.last_delivered_id = id;
    }

    /// Move the cursor forward, never back
    pub fn advance_cursor(&mut self, id: StreamId) {
        self.last_delivered_id = self.last_delivered_id.max(id);
    }

    /// The group's pending ledger
    pub fn pending(&self) -> &PendingLedger {
        &self.pending
    }

    /// Mutable access to the pending ledger
    pub fn pending_mut(&mut self) -> &mut PendingLedger {
        &mut self.pending
    }

    /// Whether a consumer is registered
    pub fn has_consumer(&self, name: &str) -> bool {
        self.consumers.contains_key(name)
    }

    /// Registered consumers, sorted by name
    pub fn consumers(&self) -> impl Iterator<Item = &Consumer> {
        self.consumers.values()
    }

    /// Register a consumer or refresh its seen time; `true` if it was new
    pub fn touch_consumer(&mut self, name: &str, now_ms: u64) -> bool {
        match self.consumers.get_mut(name) {
            Some(consumer) => {
                consumer.seen_ms = consumer.seen_ms.max(now_ms);
                false
            }
            None => {
                self.consumers.insert(
                    name.to_string(),
                    Consumer {
                        name: name.to_string(),
                        seen_ms: now_ms,
                    },
                );
                true
            }
        }
    }

    /// Deregister a consumer. Its pending records are left alone.
    pub fn remove_consumer(&mut self, name: &str) -> Option<Consumer> {
        self.consumers.remove(name)
    }

    /// Summary for inspection
    pub fn info(&self) -> GroupInfo {
        GroupInfo {
            name: self.name.clone(),
            consumers: self.consumers.len(),
            pending: self.pending.len(),
            last_delivered_id: self.last_delivered_id,
        }
    }

    /// Per-consumer detail for inspection
    pub fn consumer_infos(&self, now_ms: u64) -> Vec<ConsumerInfo> {
        self.consumers
            .values()
            .map(|c| ConsumerInfo {
                name: c.name.clone(),
                pending: self.pending.count_for(&c.name),
                seen_ms: c.seen_ms,
                idle_ms: now_ms.saturating_sub(c.seen_ms),
            })
            .collect()
    }
}
