//! Append-only stream log
//!
//! Entries live in a `BTreeMap` keyed by [`StreamId`], which gives ordered
//! iteration and `O(log n)` positioning for range queries. `last_id` only
//! ever grows: deleting or trimming the newest entries does not let a later
//! append reuse their ids.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};

use rivulet_core::{Entry, Fields, IdSpec, StreamError, StreamId, StreamResult};
use serde::{Deserialize, Serialize};

/// How to trim the oldest entries of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrimStrategy {
    /// Keep at most this many entries
    MaxLen(usize),
    /// Remove every entry with an id below this one
    MinId(StreamId),
}

/// Ordered, append-only container of entries
#[derive(Debug, Clone, Default)]
pub struct StreamLog {
    entries: BTreeMap<StreamId, Fields>,
    last_id: StreamId,
    entries_added: u64,
    max_deleted_id: StreamId,
}

impl StreamLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Largest id ever assigned (`0-0` for a fresh stream)
    pub fn last_id(&self) -> StreamId {
        self.last_id
    }

    /// Count of all appends over the stream's lifetime
    pub fn entries_added(&self) -> u64 {
        self.entries_added
    }

    /// Largest id removed by a delete or trim
    pub fn max_deleted_id(&self) -> StreamId {
        self.max_deleted_id
    }

    /// Work out the id the next append gets.
    ///
    /// `Auto` never goes backwards: when `now_ms` is at or behind the last
    /// timestamp, the successor of the last id is used instead.
    pub fn resolve_id(&self, spec: IdSpec, now_ms: u64) -> StreamResult<StreamId> {
        let last = self.last_id;
        match spec {
            IdSpec::Auto => {
                if now_ms > last.ms {
                    Ok(StreamId::new(now_ms, 0))
                } else {
                    last.successor().ok_or(StreamError::IdSpaceExhausted(last))
                }
            }
            IdSpec::Partial(ms) => {
                if ms > last.ms {
                    // `0-*` on an empty stream must not produce 0-0
                    Ok(StreamId::new(ms, if ms == 0 { 1 } else { 0 }))
                } else if ms == last.ms {
                    last.seq
                        .checked_add(1)
                        .map(|seq| StreamId::new(ms, seq))
                        .ok_or(StreamError::IdTooSmall {
                            id: StreamId::new(ms, last.seq),
                            last,
                        })
                } else {
                    Err(StreamError::IdTooSmall {
                        id: StreamId::new(ms, 0),
                        last,
                    })
                }
            }
            IdSpec::Explicit(id) => {
                if id.is_min() {
                    Err(StreamError::InvalidId(
                        "0-0 is not a valid entry id".to_string(),
                    ))
                } else if id <= last {
                    Err(StreamError::IdTooSmall { id, last })
                } else {
                    Ok(id)
                }
            }
        }
    }

    /// Store an entry under an already-resolved id
    pub fn insert(&mut self, id: StreamId, fields: Fields) -> StreamResult<()> {
        if id <= self.last_id {
            return Err(StreamError::IdTooSmall {
                id,
                last: self.last_id,
            });
        }
        self.entries.insert(id, fields);
        self.last_id = id;
        self.entries_added += 1;
        Ok(())
    }

    /// Point lookup
    pub fn get(&self, id: StreamId) -> Option<Entry> {
        self.entries
            .get(&id)
            .map(|fields| Entry::new(id, fields.clone()))
    }

    /// Whether an entry with this id is stored
    pub fn contains(&self, id: StreamId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Oldest stored entry
    pub fn first_entry(&self) -> Option<Entry> {
        self.entries
            .first_key_value()
            .map(|(id, fields)| Entry::new(*id, fields.clone()))
    }

    /// Newest stored entry
    pub fn last_entry(&self) -> Option<Entry> {
        self.entries
            .last_key_value()
            .map(|(id, fields)| Entry::new(*id, fields.clone()))
    }

    /// Entries with `start <= id <= end`, ascending
    pub fn range_forward(
        &self,
        start: StreamId,
        end: StreamId,
        limit: Option<usize>,
    ) -> Vec<Entry> {
        if start > end {
            return Vec::new();
        }
        self.entries
            .range((Included(start), Included(end)))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(id, fields)| Entry::new(*id, fields.clone()))
            .collect()
    }

    /// Entries with `start <= id <= end`, descending.
    ///
    /// The upper bound comes first, and the walk starts there, so a limit
    /// keeps the newest entries of the range.
    pub fn range_backward(
        &self,
        end: StreamId,
        start: StreamId,
        limit: Option<usize>,
    ) -> Vec<Entry> {
        if start > end {
            return Vec::new();
        }
        self.entries
            .range((Included(start), Included(end)))
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(id, fields)| Entry::new(*id, fields.clone()))
            .collect()
    }

    /// Entries strictly after `after`, ascending
    pub fn entries_after(&self, after: StreamId, limit: Option<usize>) -> Vec<Entry> {
        self.entries
            .range((Excluded(after), Unbounded))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(id, fields)| Entry::new(*id, fields.clone()))
            .collect()
    }

    /// Remove specific entries, returning how many existed
    pub fn delete(&mut self, ids: &[StreamId]) -> usize {
        let mut removed = 0;
        for id in ids {
            if self.entries.remove(id).is_some() {
                removed += 1;
                self.max_deleted_id = self.max_deleted_id.max(*id);
            }
        }
        removed
    }

    /// Resolve a trim into the first id that survives it.
    ///
    /// `None` means nothing would be removed; `Some(None)` means every entry
    /// would be removed.
    pub fn trim_floor(&self, strategy: TrimStrategy) -> Option<Option<StreamId>> {
        match strategy {
            TrimStrategy::MaxLen(max_len) => {
                let excess = self.entries.len().checked_sub(max_len)?;
                if excess == 0 {
                    return None;
                }
                Some(self.entries.keys().nth(excess).copied())
            }
            TrimStrategy::MinId(min_id) => {
                let first = *self.entries.keys().next()?;
                if first >= min_id {
                    return None;
                }
                Some(self.entries.range(min_id..).next().map(|(id, _)| *id))
            }
        }
    }

    /// Number of entries below `first_kept` (all of them for `None`)
    pub fn count_below(&self, first_kept: Option<StreamId>) -> usize {
        match first_kept {
            Some(first_kept) => self.entries.range(..first_kept).count(),
            None => self.entries.len(),
        }
    }

    /// Drop every entry below `first_kept` (all of them for `None`)
    pub fn trim_to(&mut self, first_kept: Option<StreamId>) -> usize {
        let removed = match first_kept {
            Some(first_kept) => {
                let kept = self.entries.split_off(&first_kept);
                std::mem::replace(&mut self.entries, kept)
            }
            None => std::mem::take(&mut self.entries),
        };
        if let Some(max_removed) = removed.keys().next_back() {
            self.max_deleted_id = self.max_deleted_id.max(*max_removed);
        }
        removed.len()
    }

    /// Trim in one step
    pub fn trim(&mut self, strategy: TrimStrategy) -> usize {
        match self.trim_floor(strategy) {
            Some(first_kept) => self.trim_to(first_kept),
            None => 0,
        }
    }

    /// Restore lifetime counters that entries alone cannot reproduce
    pub fn restore_meta(
        &mut self,
        last_id: StreamId,
        entries_added: u64,
        max_deleted_id: StreamId,
    ) {
        self.last_id = self.last_id.max(last_id);
        self.entries_added = entries_added;
        self.max_deleted_id = max_deleted_id;
    }

    /// Iterate over all entries, ascending
    pub fn iter(&self) -> impl Iterator<Item = Entry> + '_ {
        self.entries
            .iter()
            .map(|(id, fields)| Entry::new(*id, fields.clone()))
    }
}
