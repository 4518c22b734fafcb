//! File-backed journal
//!
//! Records are postcard-encoded, base64-wrapped and written one per line
//! to `journal.log` in the storage directory. Appends go through a
//! buffered writer; with `sync_writes` every append is flushed before it
//! returns.
//!
//! A failed write or flush may leave part of a record in the file or in
//! the writer's buffer, where a later flush would land it after records
//! written since. The journal therefore drops its writer on the first
//! error and refuses appends until it is reopened or rewritten. Reopening
//! terminates a dangling partial line so it is skipped on replay rather
//! than merged with the next record.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rivulet_core::StorageError;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::Journal;
use crate::ops::JournalRecord;

const JOURNAL_FILE: &str = "journal.log";
const JOURNAL_TEMP_FILE: &str = "journal.log.tmp";

/// Append-only journal file
#[derive(Debug)]
pub struct FileJournal {
    /// Directory holding the journal
    storage_path: PathBuf,
    /// Write handle; `None` after a failed write until reopened or
    /// rewritten
    writer: RwLock<Option<BufWriter<File>>>,
    /// Flush after every append (durability vs throughput)
    sync_writes: bool,
}

impl FileJournal {
    /// Open (or create) a journal in `storage_path`, flushing every append
    pub async fn open(storage_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_options(storage_path, true).await
    }

    /// Open with an explicit sync policy
    pub async fn with_options(
        storage_path: impl AsRef<Path>,
        sync_writes: bool,
    ) -> Result<Self, StorageError> {
        let storage_path = storage_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&storage_path).await?;

        let journal = Self {
            storage_path,
            writer: RwLock::new(None),
            sync_writes,
        };
        journal.open_writer().await?;
        Ok(journal)
    }

    /// Path of the journal file
    pub fn log_path(&self) -> PathBuf {
        self.storage_path.join(JOURNAL_FILE)
    }

    async fn open_writer(&self) -> Result<(), StorageError> {
        let log_path = self.log_path();
        let writer = Self::open_append(&log_path).await?;
        *self.writer.write().await = Some(writer);
        debug!(path = ?log_path, "Opened journal for writing");
        Ok(())
    }

    /// Open `path` for appending, first closing off a partial last line
    async fn open_append(path: &Path) -> Result<BufWriter<File>, StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await?;

        if file.metadata().await?.len() > 0 {
            file.seek(SeekFrom::End(-1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                warn!(path = ?path, "Journal ends in a partial record, terminating it");
                file.write_all(b"\n").await?;
                file.flush().await?;
            }
        }
        Ok(BufWriter::new(file))
    }

    async fn write_line(
        writer: &mut BufWriter<File>,
        line: &str,
        flush: bool,
    ) -> std::io::Result<()> {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        if flush {
            writer.flush().await?;
        }
        Ok(())
    }

    fn closed() -> StorageError {
        StorageError::io("Journal closed after a failed write; reopen to continue")
    }

    fn encode(record: &JournalRecord) -> Result<String, StorageError> {
        let bytes = postcard::to_allocvec(record)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        Ok(STANDARD.encode(bytes))
    }

    fn decode(line: &str) -> Result<JournalRecord, StorageError> {
        let bytes = STANDARD
            .decode(line.trim())
            .map_err(|e| StorageError::corrupt(e.to_string()))?;
        Ok(postcard::from_bytes(&bytes)?)
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(&self, record: &JournalRecord) -> Result<(), StorageError> {
        trace!(stream = %record.stream, op = record.op.kind(), "Journal append (file)");
        let line = Self::encode(record)?;

        let mut guard = self.writer.write().await;
        let writer = guard.as_mut().ok_or_else(Self::closed)?;

        if let Err(e) = Self::write_line(writer, &line, self.sync_writes).await {
            // Buffered bytes of the failed record must never reach the file
            guard.take();
            warn!(error = %e, "Journal write failed, closing journal");
            return Err(e.into());
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let mut guard = self.writer.write().await;
        let writer = guard.as_mut().ok_or_else(Self::closed)?;
        if let Err(e) = writer.flush().await {
            guard.take();
            warn!(error = %e, "Journal flush failed, closing journal");
            return Err(e.into());
        }
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<JournalRecord>, StorageError> {
        self.flush().await?;
        let log_path = self.log_path();
        if !tokio::fs::try_exists(&log_path).await? {
            debug!(path = ?log_path, "No journal file, starting fresh");
            return Ok(Vec::new());
        }

        info!(path = ?log_path, "Replaying journal");
        let reader = BufReader::new(File::open(&log_path).await?);
        let mut lines = reader.lines();
        let mut records = Vec::new();
        let mut error_count = 0;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match Self::decode(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error_count += 1;
                    warn!(error = %e, "Failed to decode journal record, skipping");
                }
            }
        }

        info!(
            loaded = records.len(),
            errors = error_count,
            "Finished replaying journal"
        );
        Ok(records)
    }

    async fn rewrite(&self, records: &[JournalRecord]) -> Result<(), StorageError> {
        let log_path = self.log_path();
        let temp_path = self.storage_path.join(JOURNAL_TEMP_FILE);

        info!(records = records.len(), "Compacting journal");

        {
            let file = File::create(&temp_path).await?;
            let mut writer = BufWriter::new(file);
            for record in records {
                writer.write_all(Self::encode(record)?.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            writer.flush().await?;
            writer.get_ref().sync_all().await?;
        }

        // Hold the writer lock across the swap so no append lands in the
        // old file after it has been copied. The old writer's buffer is
        // dropped: the records come from memory, which never holds an op
        // whose write failed.
        let mut guard = self.writer.write().await;
        guard.take();
        tokio::fs::rename(&temp_path, &log_path).await?;
        *guard = Some(Self::open_append(&log_path).await?);

        info!("Journal compaction complete");
        Ok(())
    }
}
