//! End-to-end scenarios for rivulet-broker
//!
//! Each test walks a producer/consumer/reclaim story through the public
//! broker API on a manual clock.

use std::sync::Arc;
use std::time::Duration;

use rivulet_broker::{
    Broker, BrokerConfig, HandlerError, IdempotentHandler, ReadOptions, ReclaimConfig,
    ReclaimHandler, ReclaimTask,
};
use rivulet_core::{Entry, Fields, IdSpec, ManualClock, StreamError, StreamId};
use rivulet_storage::{Delivery, GroupStart, PendingQuery, TrimStrategy};
use tempfile::TempDir;
use tokio::sync::broadcast;

const IDLE: Duration = Duration::from_secs(30);

fn setup() -> (Arc<Broker>, Arc<ManualClock>) {
    rivulet_logging::init_testing();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let broker = Broker::in_memory_with_clock(BrokerConfig::default(), clock.clone());
    (Arc::new(broker), clock)
}

fn event(name: &str) -> Fields {
    Fields::new().with("event", name).with("source", "test")
}

fn ids(entries: &[Entry]) -> Vec<StreamId> {
    entries.iter().map(|e| e.id).collect()
}

async fn append_three(broker: &Broker) -> Vec<StreamId> {
    let mut out = Vec::new();
    for name in ["e1", "e2", "e3"] {
        out.push(broker.append("S", event(name)).await.unwrap());
    }
    out
}

// ============================================================================
// Stream Log
// ============================================================================

#[tokio::test]
async fn test_forward_and_backward_ranges() {
    let (broker, _) = setup();
    let appended = append_three(&broker).await;

    let forward = broker
        .range_forward("S", StreamId::MIN, StreamId::MAX, Some(10))
        .await
        .unwrap();
    assert_eq!(ids(&forward), appended);
    assert_eq!(forward[0].fields.get("event"), Some("e1"));

    let backward = broker
        .range_backward("S", StreamId::MAX, StreamId::MIN, Some(10))
        .await
        .unwrap();
    let mut reversed = appended.clone();
    reversed.reverse();
    assert_eq!(ids(&backward), reversed);
}

#[tokio::test]
async fn test_same_millisecond_appends_get_increasing_sequences() {
    let (broker, _) = setup();
    let appended = append_three(&broker).await;
    assert_eq!(appended[0].seq, 0);
    assert_eq!(appended[1], StreamId::new(appended[0].ms, 1));
    assert_eq!(appended[2], StreamId::new(appended[0].ms, 2));
}

#[tokio::test]
async fn test_clock_going_backwards_never_reuses_ids() {
    let (broker, clock) = setup();
    let first = broker.append("S", event("a")).await.unwrap();
    clock.set(5);
    let second = broker.append("S", event("b")).await.unwrap();
    assert!(second > first);
    assert_eq!(second, first.successor().unwrap());
}

#[tokio::test]
async fn test_explicit_ids() {
    let (broker, _) = setup();
    let id = broker
        .append_with_id("S", IdSpec::Explicit(StreamId::new(10, 5)), event("a"))
        .await
        .unwrap();
    assert_eq!(id, StreamId::new(10, 5));

    assert!(matches!(
        broker
            .append_with_id("S", IdSpec::Explicit(StreamId::new(10, 5)), event("b"))
            .await,
        Err(StreamError::IdTooSmall { .. })
    ));
    let partial = broker
        .append_with_id("S", IdSpec::Partial(10), event("c"))
        .await
        .unwrap();
    assert_eq!(partial, StreamId::new(10, 6));
}

#[tokio::test]
async fn test_empty_fields_rejected_without_mutation() {
    let (broker, _) = setup();
    append_three(&broker).await;
    assert!(matches!(
        broker.append("S", Fields::new()).await,
        Err(StreamError::InvalidEntry(_))
    ));
    assert_eq!(broker.info("S").await.unwrap().length, 3);
}

#[tokio::test]
async fn test_trim_keeps_last_id() {
    let (broker, _) = setup();
    let appended = append_three(&broker).await;

    assert_eq!(broker.trim("S", TrimStrategy::MaxLen(1)).await.unwrap(), 2);
    let info = broker.info("S").await.unwrap();
    assert_eq!(info.length, 1);
    assert_eq!(info.last_id, appended[2]);
    assert_eq!(info.entries_added, 3);
    assert_eq!(info.max_deleted_id, appended[1]);

    assert_eq!(broker.trim("S", TrimStrategy::MaxLen(0)).await.unwrap(), 1);
    let next = broker.append("S", event("e4")).await.unwrap();
    assert!(next > appended[2]);
}

#[tokio::test]
async fn test_unknown_stream_and_group() {
    let (broker, _) = setup();
    assert!(matches!(
        broker
            .range_forward("nope", StreamId::MIN, StreamId::MAX, None)
            .await,
        Err(StreamError::StreamNotFound(_))
    ));
    append_three(&broker).await;
    assert!(matches!(
        broker.read_new("S", "nope", "A", ReadOptions::new()).await,
        Err(StreamError::GroupNotFound { .. })
    ));
}

// ============================================================================
// Consumer Groups
// ============================================================================

#[tokio::test]
async fn test_read_claim_ack_scenario() {
    let (broker, clock) = setup();
    let appended = append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::At(StreamId::MIN), false)
        .await
        .unwrap();

    let read = broker
        .read_new("S", "g", "A", ReadOptions::new().count(2))
        .await
        .unwrap();
    assert_eq!(ids(&read), appended[..2].to_vec());

    let records = broker
        .list_pending("S", "g", &PendingQuery::new())
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.owner == "A" && r.delivery_count == 1));

    clock.advance(IDLE + Duration::from_secs(1));
    let result = broker
        .auto_claim("S", "g", "B", IDLE, StreamId::MIN, 10)
        .await
        .unwrap();
    assert_eq!(ids(&result.claimed), appended[..2].to_vec());
    assert_eq!(result.next_cursor, StreamId::MIN);

    let records = broker
        .list_pending("S", "g", &PendingQuery::new())
        .await
        .unwrap();
    assert!(records.iter().all(|r| r.owner == "B" && r.delivery_count == 2));

    assert_eq!(broker.ack("S", "g", &[appended[0]]).await.unwrap(), 1);
    assert_eq!(broker.pending("S", "g").await.unwrap().total, 1);
}

#[tokio::test]
async fn test_ack_is_idempotent() {
    let (broker, _) = setup();
    let appended = append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();

    // Never delivered
    assert_eq!(broker.ack("S", "g", &[appended[0]]).await.unwrap(), 0);

    broker
        .read_new("S", "g", "A", ReadOptions::new().count(1))
        .await
        .unwrap();
    assert_eq!(broker.ack("S", "g", &[appended[0]]).await.unwrap(), 1);
    assert_eq!(broker.ack("S", "g", &[appended[0]]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_groups_are_independent() {
    let (broker, _) = setup();
    append_three(&broker).await;
    for group in ["g1", "g2"] {
        broker
            .create_group("S", group, GroupStart::Beginning, false)
            .await
            .unwrap();
    }

    let a = broker
        .read_new("S", "g1", "A", ReadOptions::new())
        .await
        .unwrap();
    let b = broker
        .read_new("S", "g2", "B", ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(ids(&a), ids(&b));
    assert_eq!(broker.groups("S").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_group_from_now_sees_only_new_entries() {
    let (broker, _) = setup();
    append_three(&broker).await;
    broker
        .create_group("S", "live", GroupStart::Latest, false)
        .await
        .unwrap();
    assert!(broker
        .read_new("S", "live", "A", ReadOptions::new())
        .await
        .unwrap()
        .is_empty());

    let id = broker.append("S", event("e4")).await.unwrap();
    let read = broker
        .read_new("S", "live", "A", ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(ids(&read), vec![id]);
}

#[tokio::test]
async fn test_ensure_group_is_benign_on_repeat() {
    let (broker, _) = setup();
    assert!(broker
        .ensure_group("S", "g", GroupStart::Beginning, true)
        .await
        .unwrap());
    assert!(!broker
        .ensure_group("S", "g", GroupStart::Beginning, true)
        .await
        .unwrap());
    assert!(matches!(
        broker
            .create_group("S", "g", GroupStart::Beginning, true)
            .await,
        Err(StreamError::GroupExists(_))
    ));
}

#[tokio::test]
async fn test_destroy_group_drops_pending() {
    let (broker, _) = setup();
    append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();
    broker
        .read_new("S", "g", "A", ReadOptions::new())
        .await
        .unwrap();

    assert!(broker.destroy_group("S", "g").await.unwrap());
    assert!(!broker.destroy_group("S", "g").await.unwrap());
    assert!(matches!(
        broker.pending("S", "g").await,
        Err(StreamError::GroupNotFound { .. })
    ));
    // Entries are independent of group state
    assert_eq!(broker.info("S").await.unwrap().length, 3);
}

#[tokio::test]
async fn test_set_group_cursor_rewinds() {
    let (broker, _) = setup();
    let appended = append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();
    broker
        .read_new("S", "g", "A", ReadOptions::new())
        .await
        .unwrap();

    broker
        .set_group_cursor("S", "g", GroupStart::At(appended[0]))
        .await
        .unwrap();
    let again = broker
        .read_new("S", "g", "B", ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(ids(&again), appended[1..].to_vec());

    // Redelivered ids now belong to B with a fresh record
    let records = broker
        .list_pending("S", "g", &PendingQuery::new().consumer("B"))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.delivery_count == 1));
    assert_eq!(broker.pending("S", "g").await.unwrap().total, 3);
}

#[tokio::test]
async fn test_remove_consumer_leaves_pending_for_reclaim() {
    let (broker, clock) = setup();
    append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();
    broker
        .read_new("S", "g", "A", ReadOptions::new())
        .await
        .unwrap();

    assert_eq!(broker.remove_consumer("S", "g", "A").await.unwrap(), 3);
    assert!(broker.consumers("S", "g").await.unwrap().is_empty());
    assert_eq!(broker.pending("S", "g").await.unwrap().total, 3);

    clock.advance(IDLE);
    let result = broker
        .auto_claim("S", "g", "B", IDLE, StreamId::MIN, 10)
        .await
        .unwrap();
    assert_eq!(result.claimed.len(), 3);
}

#[tokio::test]
async fn test_consumer_info_tracks_idle() {
    let (broker, clock) = setup();
    broker
        .create_group("S", "g", GroupStart::Beginning, true)
        .await
        .unwrap();
    assert!(broker.create_consumer("S", "g", "A").await.unwrap());
    assert!(!broker.create_consumer("S", "g", "A").await.unwrap());

    clock.advance(Duration::from_secs(7));
    let infos = broker.consumers("S", "g").await.unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].idle_ms, 7_000);
}

// ============================================================================
// Pending Entry Ledger
// ============================================================================

#[tokio::test]
async fn test_claim_only_moves_idle_entries() {
    let (broker, clock) = setup();
    let appended = append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();
    broker
        .read_new("S", "g", "A", ReadOptions::new().count(1))
        .await
        .unwrap();
    clock.advance(IDLE);
    broker
        .read_new("S", "g", "A", ReadOptions::new().count(1))
        .await
        .unwrap();

    let result = broker
        .claim("S", "g", "B", IDLE, &appended)
        .await
        .unwrap();
    assert_eq!(ids(&result.claimed), vec![appended[0]]);
    assert!(result.deleted.is_empty());

    let summary = broker.pending("S", "g").await.unwrap();
    assert_eq!(
        summary.per_consumer,
        vec![("A".to_string(), 1), ("B".to_string(), 1)]
    );
    assert_eq!(summary.min_id, Some(appended[0]));
    assert_eq!(summary.max_id, Some(appended[1]));
}

#[tokio::test]
async fn test_reclaim_by_same_owner_still_counts() {
    let (broker, clock) = setup();
    let appended = append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();
    broker
        .read_new("S", "g", "A", ReadOptions::new().count(1))
        .await
        .unwrap();

    clock.advance(IDLE);
    broker
        .claim("S", "g", "A", IDLE, &[appended[0]])
        .await
        .unwrap();
    let records = broker
        .list_pending("S", "g", &PendingQuery::new())
        .await
        .unwrap();
    assert_eq!(records[0].owner, "A");
    assert_eq!(records[0].delivery_count, 2);
}

#[tokio::test]
async fn test_claim_reports_deleted_entries() {
    let (broker, clock) = setup();
    let appended = append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();
    broker
        .read_new("S", "g", "A", ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(broker.delete("S", &[appended[1]]).await.unwrap(), 1);

    clock.advance(IDLE);
    let result = broker
        .auto_claim("S", "g", "B", IDLE, StreamId::MIN, 10)
        .await
        .unwrap();
    assert_eq!(ids(&result.claimed), vec![appended[0], appended[2]]);
    assert_eq!(result.deleted, vec![appended[1]]);
    assert_eq!(broker.pending("S", "g").await.unwrap().total, 2);
}

#[tokio::test]
async fn test_auto_claim_cursor_covers_skipped_entries() {
    let (broker, clock) = setup();
    for i in 0..6 {
        broker.append("S", event(&i.to_string())).await.unwrap();
    }
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();

    // Alternate old and fresh deliveries
    for _ in 0..3 {
        broker
            .read_new("S", "g", "A", ReadOptions::new().count(1))
            .await
            .unwrap();
        clock.advance(IDLE);
        broker
            .read_new("S", "g", "A", ReadOptions::new().count(1))
            .await
            .unwrap();
    }

    let mut cursor = StreamId::MIN;
    let mut calls = 0;
    let mut claimed = Vec::new();
    loop {
        let result = broker
            .auto_claim("S", "g", "B", IDLE, cursor, 1)
            .await
            .unwrap();
        calls += 1;
        claimed.extend(ids(&result.claimed));
        cursor = result.next_cursor;
        if cursor.is_min() {
            break;
        }
    }
    assert!(calls >= 3);
    assert!(!claimed.is_empty());
    let records = broker
        .list_pending("S", "g", &PendingQuery::new().consumer("B"))
        .await
        .unwrap();
    assert_eq!(records.len(), claimed.len());
}

#[tokio::test]
async fn test_read_pending_history() {
    let (broker, _) = setup();
    let appended = append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();
    broker
        .read_new("S", "g", "A", ReadOptions::new())
        .await
        .unwrap();
    broker.delete("S", &[appended[0]]).await.unwrap();

    let history = broker
        .read_pending("S", "g", "A", StreamId::MIN, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0], Delivery::Deleted(appended[0]));
    assert!(matches!(&history[1], Delivery::Entry(e) if e.id == appended[1]));

    let after = broker
        .read_pending("S", "g", "A", appended[1], Some(10))
        .await
        .unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id(), appended[2]);

    assert!(broker
        .read_pending("S", "g", "other", StreamId::MIN, None)
        .await
        .unwrap()
        .is_empty());
}

// ============================================================================
// Reclaim Task
// ============================================================================

struct FailOn(StreamId);

#[async_trait::async_trait]
impl ReclaimHandler for FailOn {
    async fn handle(&self, entry: &Entry) -> Result<(), HandlerError> {
        if entry.id == self.0 {
            Err(HandlerError::new("poison"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_sweep_acks_only_successful_entries() {
    let (broker, clock) = setup();
    let appended = append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();
    broker
        .read_new("S", "g", "crashed", ReadOptions::new())
        .await
        .unwrap();
    clock.advance(IDLE);

    let (_tx, rx) = broadcast::channel(1);
    let config = ReclaimConfig::new("S", "g")
        .with_min_idle(IDLE)
        .with_batch_size(2);
    let task = ReclaimTask::new(
        Arc::clone(&broker),
        Arc::new(FailOn(appended[1])),
        config,
        rx,
    );

    let report = task.sweep_once().await.unwrap();
    assert_eq!(report.claimed, 3);
    assert_eq!(report.acked, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.batches, 2);

    let records = broker
        .list_pending("S", "g", &PendingQuery::new())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entry_id, appended[1]);
    assert_eq!(records[0].owner, "reclaimer");

    // Not idle again yet
    let report = task.sweep_once().await.unwrap();
    assert_eq!(report.claimed, 0);
}

#[tokio::test]
async fn test_reclaim_task_runs_until_shutdown() {
    let (broker, clock) = setup();
    append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();
    broker
        .read_new("S", "g", "crashed", ReadOptions::new())
        .await
        .unwrap();
    clock.advance(IDLE);

    let handler = Arc::new(IdempotentHandler::new(|_: &Entry| -> Result<(), HandlerError> {
        Ok(())
    }));
    let (tx, rx) = broadcast::channel(1);
    let config = ReclaimConfig::new("S", "g")
        .with_min_idle(IDLE)
        .with_interval(Duration::from_millis(10));
    let join = ReclaimTask::spawn(Arc::clone(&broker), handler.clone(), config, rx);

    // The first tick fires immediately
    for _ in 0..200 {
        if broker.pending("S", "g").await.unwrap().total == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.pending("S", "g").await.unwrap().total, 0);

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .unwrap()
        .unwrap();
    // Acked ids are no longer remembered
    assert_eq!(handler.processed_count(), 0);
}

#[tokio::test]
async fn test_sweep_drains_idempotent_handler() {
    let (broker, clock) = setup();
    let appended = append_three(&broker).await;
    broker
        .create_group("S", "g", GroupStart::Beginning, false)
        .await
        .unwrap();
    broker
        .read_new("S", "g", "crashed", ReadOptions::new())
        .await
        .unwrap();
    clock.advance(IDLE);

    let handler = Arc::new(IdempotentHandler::new(FailOn(appended[1])));
    let (_tx, rx) = broadcast::channel(1);
    let config = ReclaimConfig::new("S", "g").with_min_idle(IDLE);
    let task = ReclaimTask::new(Arc::clone(&broker), handler.clone(), config, rx);

    let report = task.sweep_once().await.unwrap();
    assert_eq!(report.acked, 2);
    assert_eq!(handler.processed_count(), 0);
    assert!(!handler.is_processed(appended[0]));
    assert!(!handler.is_processed(appended[1]));

    // Repeated sweeps over a long-lived handler stay bounded
    for round in 0..5 {
        broker
            .append("S", event(&format!("later-{round}")))
            .await
            .unwrap();
        broker
            .read_new("S", "g", "crashed", ReadOptions::new())
            .await
            .unwrap();
        clock.advance(IDLE);
        task.sweep_once().await.unwrap();
        assert_eq!(handler.processed_count(), 0);
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let config = BrokerConfig::with_data_dir(dir.path());

    let (appended, expected_pending) = {
        let broker = Broker::open(config.clone(), clock.clone()).await.unwrap();
        let appended = append_three(&broker).await;
        broker
            .create_group("S", "g", GroupStart::Beginning, false)
            .await
            .unwrap();
        broker
            .read_new("S", "g", "A", ReadOptions::new().count(2))
            .await
            .unwrap();
        clock.advance(IDLE);
        broker
            .claim("S", "g", "B", IDLE, &[appended[0]])
            .await
            .unwrap();
        broker.ack("S", "g", &[appended[1]]).await.unwrap();
        broker.flush().await.unwrap();
        let pending = broker
            .list_pending("S", "g", &PendingQuery::new())
            .await
            .unwrap();
        (appended, pending)
    };

    let broker = Broker::open(config, clock.clone()).await.unwrap();
    assert_eq!(broker.info("S").await.unwrap().length, 3);
    assert_eq!(
        broker
            .list_pending("S", "g", &PendingQuery::new())
            .await
            .unwrap(),
        expected_pending
    );
    assert_eq!(expected_pending[0].owner, "B");
    assert_eq!(expected_pending[0].delivery_count, 2);

    // The cursor survived too: only the third entry is new
    let read = broker
        .read_new("S", "g", "C", ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(ids(&read), vec![appended[2]]);
}

#[tokio::test]
async fn test_compaction_preserves_state() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let config = BrokerConfig::with_data_dir(dir.path());

    let (info, groups) = {
        let broker = Broker::open(config.clone(), clock.clone()).await.unwrap();
        for i in 0..50 {
            broker.append("S", event(&i.to_string())).await.unwrap();
        }
        broker
            .create_group("S", "g", GroupStart::Beginning, false)
            .await
            .unwrap();
        let read = broker
            .read_new("S", "g", "A", ReadOptions::new().count(20))
            .await
            .unwrap();
        broker.ack("S", "g", &ids(&read[..10])).await.unwrap();
        broker.trim("S", TrimStrategy::MaxLen(25)).await.unwrap();
        broker.append("T", event("other")).await.unwrap();
        broker.delete_stream("T").await.unwrap();

        let written = broker.compact().await.unwrap();
        // 25 entries, meta, group, consumer, 10 pending
        assert_eq!(written, 25 + 1 + 1 + 1 + 10);
        broker.append("S", event("after")).await.unwrap();
        (broker.info("S").await.unwrap(), broker.groups("S").await.unwrap())
    };

    let broker = Broker::open(config, clock).await.unwrap();
    assert_eq!(broker.streams(), vec!["S".to_string()]);
    assert_eq!(broker.info("S").await.unwrap(), info);
    assert_eq!(broker.groups("S").await.unwrap(), groups);
}
