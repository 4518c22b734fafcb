//! # Rivulet Storage
//!
//! In-memory stream structures and the operation journal that makes them
//! durable.
//!
//! ## Features
//!
//! - **StreamLog**: Ordered, append-only entry container with forward and
//!   backward range queries and trimming
//! - **ConsumerGroup**: Independently cursored view over a stream with a
//!   consumer roster
//! - **PendingLedger**: Per-group table of delivered-but-unacknowledged
//!   entries, one owner per entry
//! - **StreamState**: Plan/apply state machine driven by serializable
//!   [`StreamOp`]s
//! - **Journal trait**: Durable record of applied ops, replayed on startup
//! - **MemoryJournal**: No durability, for tests and embedded use
//! - **FileJournal**: Newline-delimited append-only file
//!
//! ## Example
//!
//! ```rust,ignore
//! use rivulet_core::{Fields, IdSpec};
//! use rivulet_storage::{Journal, JournalRecord, MemoryJournal, StreamState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let journal = MemoryJournal::new();
//!     let mut state = StreamState::new("orders");
//!
//!     // Plan, write the journal first, then apply
//!     let (op, id) = state
//!         .plan_append(IdSpec::Auto, Fields::new().with("sku", "42"), 1_000)
//!         .unwrap();
//!     journal.append(&JournalRecord::new("orders", op.clone())).await.unwrap();
//!     state.apply(&op).unwrap();
//!
//!     assert_eq!(state.log().last_id(), id);
//! }
//! ```

pub mod consumer_group;
pub mod memory;
pub mod ops;
pub mod pending;
pub mod persistent;
pub mod state;
pub mod stream_log;

// Re-exports
pub use consumer_group::{Consumer, ConsumerGroup, ConsumerInfo, GroupInfo, GroupStart};
pub use memory::MemoryJournal;
pub use ops::{JournalRecord, StreamOp};
pub use pending::{LedgerScan, PendingLedger, PendingQuery, PendingRecord, PendingSummary};
pub use persistent::FileJournal;
pub use state::{AutoClaimResult, ClaimResult, Delivery, StreamInfo, StreamState, rebuild};
pub use stream_log::{StreamLog, TrimStrategy};

use async_trait::async_trait;
use rivulet_core::StorageError;

/// Durable, ordered record of stream operations
///
/// The broker appends every op before applying it to memory. On startup the
/// full record sequence is replayed through [`rebuild`] to reconstruct the
/// streams.
#[async_trait]
pub trait Journal: Send + Sync + std::fmt::Debug {
    /// Append a record
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be encoded or written. The
    /// caller must not apply the op in that case.
    async fn append(&self, record: &JournalRecord) -> Result<(), StorageError>;

    /// Flush any buffered records to the backing store
    async fn flush(&self) -> Result<(), StorageError>;

    /// Every record written so far, in order
    ///
    /// Records that cannot be decoded are skipped.
    async fn replay(&self) -> Result<Vec<JournalRecord>, StorageError>;

    /// Replace the whole journal with `records` (compaction)
    ///
    /// Implementations must make the swap atomic: after a crash, either the
    /// old or the new record sequence is replayed, never a mix.
    async fn rewrite(&self, records: &[JournalRecord]) -> Result<(), StorageError>;
}
