//! Stream operations
//!
//! Every mutation of a stream is expressed as a [`StreamOp`] carrying all
//! of its resolved inputs (ids, owners, timestamps). Applying an op never
//! consults the clock, so replaying the same ops in the same order always
//! rebuilds the same state.

use rivulet_core::{Fields, StreamId};
use serde::{Deserialize, Serialize};

use crate::pending::PendingRecord;

/// A single deterministic mutation of one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamOp {
    /// Store an entry under a resolved id
    Append { id: StreamId, fields: Fields },
    /// Remove entries
    Delete { ids: Vec<StreamId> },
    /// Remove all entries below `first_kept` (every entry for `None`)
    Trim { first_kept: Option<StreamId> },
    /// Create a consumer group
    CreateGroup {
        group: String,
        last_delivered_id: StreamId,
    },
    /// Destroy a group and its pending records
    DestroyGroup { group: String },
    /// Reposition a group's cursor
    SetGroupCursor { group: String, id: StreamId },
    /// Register a consumer
    CreateConsumer {
        group: String,
        consumer: String,
        at_ms: u64,
    },
    /// Deregister a consumer, optionally handing its pending records over
    RemoveConsumer {
        group: String,
        consumer: String,
        reassign_to: Option<String>,
        at_ms: u64,
    },
    /// First delivery of new entries; advances the cursor
    Deliver {
        group: String,
        consumer: String,
        ids: Vec<StreamId>,
        at_ms: u64,
    },
    /// Re-read of entries the consumer already owns
    Redeliver {
        group: String,
        consumer: String,
        ids: Vec<StreamId>,
        at_ms: u64,
    },
    /// Ownership change of idle records; `dropped` ids had lost their entry
    Claim {
        group: String,
        consumer: String,
        ids: Vec<StreamId>,
        dropped: Vec<StreamId>,
        at_ms: u64,
    },
    /// Acknowledge pending records
    Ack { group: String, ids: Vec<StreamId> },
    /// Lifetime counters, written by compaction
    RestoreMeta {
        last_id: StreamId,
        entries_added: u64,
        max_deleted_id: StreamId,
    },
    /// A pending record verbatim, written by compaction
    RestorePending { group: String, record: PendingRecord },
    /// Drop the whole stream
    DeleteStream,
}

impl StreamOp {
    /// Whether blocked readers should re-check for new entries
    pub fn wakes_readers(&self) -> bool {
        matches!(
            self,
            Self::Append { .. }
                | Self::SetGroupCursor { .. }
                | Self::DestroyGroup { .. }
                | Self::DeleteStream
        )
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Append { .. } => "append",
            Self::Delete { .. } => "delete",
            Self::Trim { .. } => "trim",
            Self::CreateGroup { .. } => "create_group",
            Self::DestroyGroup { .. } => "destroy_group",
            Self::SetGroupCursor { .. } => "set_group_cursor",
            Self::CreateConsumer { .. } => "create_consumer",
            Self::RemoveConsumer { .. } => "remove_consumer",
            Self::Deliver { .. } => "deliver",
            Self::Redeliver { .. } => "redeliver",
            Self::Claim { .. } => "claim",
            Self::Ack { .. } => "ack",
            Self::RestoreMeta { .. } => "restore_meta",
            Self::RestorePending { .. } => "restore_pending",
            Self::DeleteStream => "delete_stream",
        }
    }
}

/// A stream operation tagged with the stream it applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Stream name
    pub stream: String,
    /// The operation
    pub op: StreamOp,
}

impl JournalRecord {
    /// Create a new record
    pub fn new(stream: impl Into<String>, op: StreamOp) -> Self {
        Self {
            stream: stream.into(),
            op,
        }
    }
}
