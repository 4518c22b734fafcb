//! In-memory journal
//!
//! Keeps records in a vector. Nothing survives the process, but the
//! records can be inspected and replayed, which is what tests need.

use async_trait::async_trait;
use parking_lot::Mutex;
use rivulet_core::StorageError;
use tracing::trace;

use crate::Journal;
use crate::ops::JournalRecord;

/// Journal held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryJournal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a journal pre-loaded with records
    pub fn with_records(records: Vec<JournalRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Snapshot of the records written so far
    pub fn records(&self) -> Vec<JournalRecord> {
        self.records.lock().clone()
    }

    /// Number of records written
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, record: &JournalRecord) -> Result<(), StorageError> {
        trace!(stream = %record.stream, op = record.op.kind(), "Journal append (memory)");
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<JournalRecord>, StorageError> {
        Ok(self.records())
    }

    async fn rewrite(&self, records: &[JournalRecord]) -> Result<(), StorageError> {
        *self.records.lock() = records.to_vec();
        Ok(())
    }
}
