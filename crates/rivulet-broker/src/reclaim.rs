//! Background reclaim of abandoned entries
//!
//! A crashed consumer leaves its deliveries in the pending ledger. The
//! [`ReclaimTask`] periodically sweeps a group's ledger with
//! [`Broker::auto_claim`], hands every claimed entry to a
//! [`ReclaimHandler`], and acknowledges only what the handler finished.
//! Failed entries stay pending and are picked up again once they are idle,
//! so delivery is at-least-once and handlers must tolerate repeats
//! ([`IdempotentHandler`] helps with that).
//!
//! The task is owned by the embedding application: it is spawned
//! explicitly and stopped through a broadcast shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use rivulet_core::{Entry, StreamId, StreamResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::Broker;

/// Failure reported by a [`ReclaimHandler`]
#[derive(Debug, Clone, Error)]
#[error("Handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create a new handler error
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Downstream processing step for reclaimed entries
///
/// Returning `Ok` means the entry is done and may be acknowledged.
#[async_trait]
pub trait ReclaimHandler: Send + Sync {
    async fn handle(&self, entry: &Entry) -> Result<(), HandlerError>;

    /// Called once `ids` have been acknowledged and left the ledger
    fn forget(&self, _ids: &[StreamId]) {}
}

#[async_trait]
impl<F> ReclaimHandler for F
where
    F: Fn(&Entry) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, entry: &Entry) -> Result<(), HandlerError> {
        self(entry)
    }
}

/// Skips entries that were already processed successfully
///
/// Redelivery after a lost acknowledgment hands the same id out again;
/// this wrapper remembers every id the inner handler finished and reports
/// repeats as done without running the side effect twice. An id is
/// dropped from the set once its acknowledgment lands.
pub struct IdempotentHandler<H> {
    inner: H,
    processed: DashSet<StreamId>,
}

impl<H: ReclaimHandler> IdempotentHandler<H> {
    /// Wrap a handler
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            processed: DashSet::new(),
        }
    }

    /// Whether `id` has been processed
    pub fn is_processed(&self, id: StreamId) -> bool {
        self.processed.contains(&id)
    }

    /// Number of processed ids not yet acknowledged
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}

#[async_trait]
impl<H: ReclaimHandler> ReclaimHandler for IdempotentHandler<H> {
    async fn handle(&self, entry: &Entry) -> Result<(), HandlerError> {
        if self.processed.contains(&entry.id) {
            trace!(id = %entry.id, "Already processed, skipping");
            return Ok(());
        }
        self.inner.handle(entry).await?;
        self.processed.insert(entry.id);
        Ok(())
    }

    fn forget(&self, ids: &[StreamId]) {
        for id in ids {
            self.processed.remove(id);
        }
        self.inner.forget(ids);
    }
}

/// Configuration for a [`ReclaimTask`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Stream to sweep
    pub stream: String,
    /// Group whose ledger is swept
    pub group: String,
    /// Consumer that takes ownership of reclaimed entries
    pub consumer: String,
    /// Minimum idle time before an entry is reclaimed, in milliseconds
    pub min_idle_ms: u64,
    /// Time between sweeps, in milliseconds
    pub interval_ms: u64,
    /// Entries claimed per `auto_claim` call
    pub batch_size: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            stream: String::new(),
            group: String::new(),
            consumer: "reclaimer".to_string(),
            min_idle_ms: 30_000,
            interval_ms: 5_000,
            batch_size: 100,
        }
    }
}

impl ReclaimConfig {
    /// Create a configuration for one stream and group
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            ..Self::default()
        }
    }

    /// Set the claiming consumer
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Set the idle threshold
    pub fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the sweep interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the batch size (at least 1)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Idle threshold
    pub fn min_idle(&self) -> Duration {
        Duration::from_millis(self.min_idle_ms)
    }

    /// Sweep interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Outcome of one full sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// `auto_claim` calls made
    pub batches: usize,
    /// Entries claimed and handed to the handler
    pub claimed: usize,
    /// Entries acknowledged after the handler succeeded
    pub acked: usize,
    /// Entries the handler failed on, left pending
    pub failed: usize,
    /// Pending ids dropped because their entry was gone
    pub deleted: usize,
}

/// Periodic reclaim loop for one group
pub struct ReclaimTask {
    broker: Arc<Broker>,
    handler: Arc<dyn ReclaimHandler>,
    config: ReclaimConfig,
    /// Shutdown signal
    shutdown_rx: broadcast::Receiver<()>,
    /// Completed sweeps
    sweep_count: u64,
}

impl ReclaimTask {
    /// Create a reclaim task
    pub fn new(
        broker: Arc<Broker>,
        handler: Arc<dyn ReclaimHandler>,
        config: ReclaimConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            broker,
            handler,
            config,
            shutdown_rx,
            sweep_count: 0,
        }
    }

    /// Spawn the reclaim loop as a background task
    pub fn spawn(
        broker: Arc<Broker>,
        handler: Arc<dyn ReclaimHandler>,
        config: ReclaimConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let task = Self::new(broker, handler, config, shutdown_rx);
        tokio::spawn(async move {
            task.run().await;
        })
    }

    /// Run the reclaim loop until shutdown
    async fn run(mut self) {
        info!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer,
            interval_ms = self.config.interval_ms,
            "Reclaim task started"
        );

        let period = self.config.interval().max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!(sweeps = self.sweep_count, "Reclaim task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep_count += 1;
                    match self.sweep_once().await {
                        Ok(report) if report.claimed > 0 || report.deleted > 0 => {
                            info!(
                                claimed = report.claimed,
                                acked = report.acked,
                                failed = report.failed,
                                deleted = report.deleted,
                                "Reclaim sweep finished"
                            );
                        }
                        Ok(_) => trace!("Reclaim sweep found nothing idle"),
                        Err(e) => error!(error = %e, "Reclaim sweep failed"),
                    }
                }
            }
        }
    }

    /// Sweep the whole ledger once.
    ///
    /// Calls `auto_claim` from `0-0` until the cursor wraps back to `0-0`.
    pub async fn sweep_once(&self) -> StreamResult<SweepReport> {
        let ReclaimConfig {
            stream,
            group,
            consumer,
            ..
        } = &self.config;
        let min_idle = self.config.min_idle();
        let batch_size = self.config.batch_size.max(1);

        let mut report = SweepReport::default();
        let mut cursor = StreamId::MIN;
        loop {
            let result = self
                .broker
                .auto_claim(stream, group, consumer, min_idle, cursor, batch_size)
                .await?;
            report.batches += 1;
            report.claimed += result.claimed.len();
            report.deleted += result.deleted.len();

            let mut done = Vec::with_capacity(result.claimed.len());
            for entry in &result.claimed {
                match self.handler.handle(entry).await {
                    Ok(()) => done.push(entry.id),
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            id = %entry.id,
                            error = %e,
                            "Reclaim handler failed, entry stays pending"
                        );
                    }
                }
            }
            if !done.is_empty() {
                report.acked += self.broker.ack(stream, group, &done).await?;
                self.handler.forget(&done);
            }

            debug!(
                cursor = %cursor,
                next_cursor = %result.next_cursor,
                claimed = result.claimed.len(),
                "Reclaim batch"
            );
            cursor = result.next_cursor;
            if cursor.is_min() {
                break;
            }
        }
        Ok(report)
    }
}
