//! The sync orchestrator.
//!
//! One [`SyncEngine::try_sync`] call runs a complete cycle: select a
//! batch, transmit it, apply per-item outcomes, merge server-origin
//! updates, advance the checkpoint, and garbage-collect. The engine is
//! synchronous; the background worker in [`crate::service`] decides
//! when cycles run.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityProbe;
use crate::error::SyncResult;
use crate::resolver::ConflictResolver;
use crate::state::{SyncReport, SyncState, SyncStateCell, SyncStats};
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tillsync_protocol::{BatchSyncRequest, ItemResult, QueueItem};
use tillsync_queue::{ItemOutcome, SyncQueue};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How one [`SyncEngine::try_sync`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A batch round trip completed with these per-item results.
    Completed {
        /// Items the remote acknowledged.
        synced: usize,
        /// Items the remote rejected or that got no outcome.
        failed: usize,
    },
    /// The remote is unreachable; nothing was attempted.
    SkippedOffline,
    /// Nothing was eligible for transmission.
    SkippedEmpty,
    /// Another cycle is already in flight.
    Busy,
}

/// Orchestrates sync cycles over a queue, a transport, and a resolver.
pub struct SyncEngine<T: SyncTransport> {
    config: SyncConfig,
    queue: Arc<SyncQueue>,
    transport: Arc<T>,
    resolver: ConflictResolver,
    probe: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    state: SyncStateCell,
    stats: RwLock<SyncStats>,
    in_flight: AtomicBool,
}

/// Releases the single-flight gate when a cycle ends, on any path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Creates an engine.
    pub fn new(
        config: SyncConfig,
        queue: Arc<SyncQueue>,
        transport: Arc<T>,
        resolver: ConflictResolver,
        probe: Arc<dyn ConnectivityProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            queue,
            transport,
            resolver,
            probe,
            clock,
            state: SyncStateCell::new(),
            stats: RwLock::new(SyncStats::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Returns the queue this engine drains.
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Returns the engine's configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn probe(&self) -> Arc<dyn ConnectivityProbe> {
        Arc::clone(&self.probe)
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Returns the current sync state.
    pub fn state(&self) -> SyncState {
        self.state.current()
    }

    /// Subscribes to sync state transitions.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Returns a copy of the accumulated counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Builds the on-demand status report.
    pub fn report(&self) -> SyncReport {
        SyncReport {
            counts: self.queue.counts(),
            last_sync_timestamp: self.queue.last_sync_timestamp(),
            state: self.state.current(),
        }
    }

    /// Runs one sync cycle if none is in flight.
    ///
    /// Concurrent callers lose the gate race and get
    /// [`CycleOutcome::Busy`] immediately; nobody ever blocks waiting
    /// for a running cycle. Offline and empty-queue aborts return
    /// before any state transition is published.
    ///
    /// # Errors
    ///
    /// Returns an error when the batch round trip itself fails
    /// (transport, timeout, protocol, or a checkpoint that cannot be
    /// persisted). Per-item rejections are not errors; they are counted
    /// in [`CycleOutcome::Completed`].
    pub fn try_sync(&self) -> SyncResult<CycleOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync already in flight, skipping");
            return Ok(CycleOutcome::Busy);
        }
        let _guard = FlightGuard(&self.in_flight);

        if !self.probe.is_online() {
            debug!("offline, skipping sync");
            return Ok(CycleOutcome::SkippedOffline);
        }

        let now = self.clock.now_millis();
        let batch = self.select_batch(now);
        if batch.is_empty() {
            return Ok(CycleOutcome::SkippedEmpty);
        }

        self.state.set(SyncState::Syncing);
        match self.run_cycle(batch, now) {
            Ok((synced, failed)) => {
                self.state.set(SyncState::Success { synced, failed });
                self.state.set(SyncState::Idle);
                Ok(CycleOutcome::Completed { synced, failed })
            }
            Err(err) => {
                let message = err.to_string();
                self.stats.write().last_error = Some(message.clone());
                self.state.set(SyncState::Error(message));
                self.state.set(SyncState::Idle);
                Err(err)
            }
        }
    }

    /// Selects the next batch: pending items plus failed items whose
    /// backoff delay has elapsed, oldest first, capped at the batch
    /// size.
    fn select_batch(&self, now: i64) -> Vec<QueueItem> {
        let retry = &self.config.retry;
        self.queue
            .list_pending(retry.max_attempts)
            .into_iter()
            .filter(|item| {
                if item.retry_count == 0 {
                    return true;
                }
                let delay = retry.delay_for_attempt(item.retry_count).as_millis() as i64;
                item.last_attempt_at
                    .map_or(true, |last| now - last >= delay)
            })
            .take(self.config.batch_size)
            .collect()
    }

    fn run_cycle(&self, batch: Vec<QueueItem>, now: i64) -> SyncResult<(usize, usize)> {
        let ids: Vec<Uuid> = batch.iter().map(|item| item.id).collect();
        let marked = self.queue.mark_syncing(&ids, now)?;
        if marked.is_empty() {
            return Ok((0, 0));
        }

        let request = BatchSyncRequest::new(
            self.queue.device_id(),
            self.queue.last_sync_timestamp(),
            marked.iter().map(QueueItem::to_batch_item).collect(),
        );
        info!(items = marked.len(), "sending sync batch");

        let response = match self.transport.send(&request) {
            Ok(response) => response,
            Err(err) => {
                // The whole batch failed in transit; every marked item
                // gets a failure outcome so retry accounting advances.
                let message = err.to_string();
                for item in &marked {
                    if let Err(storage_err) = self.queue.apply_outcome(
                        item.id,
                        ItemOutcome::Failed {
                            error: message.clone(),
                        },
                    ) {
                        warn!(id = %item.id, %storage_err, "failed to record transit failure");
                    }
                }
                self.stats.write().items_failed += marked.len() as u64;
                return Err(err);
            }
        };

        let mut outcomes: HashMap<Uuid, ItemResult> = response
            .item_results
            .into_iter()
            .map(|result| (result.id, result))
            .collect();

        let mut synced = 0usize;
        let mut failed = 0usize;
        for item in &marked {
            let outcome = match outcomes.remove(&item.id) {
                Some(result) if !response.success => ItemOutcome::Failed {
                    error: result
                        .error
                        .unwrap_or_else(|| "batch rejected by server".into()),
                },
                Some(result) if result.success => ItemOutcome::Synced {
                    server_payload: result.server_payload,
                },
                Some(result) => ItemOutcome::Failed {
                    error: result.error.unwrap_or_else(|| "rejected".into()),
                },
                // No explicit outcome means not applied. Treating it as
                // success would drop the mutation on a truncated
                // response.
                None => ItemOutcome::Failed {
                    error: "no outcome returned for item".into(),
                },
            };

            match &outcome {
                ItemOutcome::Synced { .. } => synced += 1,
                ItemOutcome::Failed { .. } => failed += 1,
            }
            if let Err(storage_err) = self.queue.apply_outcome(item.id, outcome) {
                warn!(id = %item.id, %storage_err, "failed to record item outcome");
            }
        }

        let mut superseded = 0usize;
        if let Some(updates) = &response.server_updates {
            if !updates.is_empty() {
                let summary = self.resolver.apply(updates);
                superseded = summary.superseded;
                debug!(
                    merged = summary.merged,
                    superseded = summary.superseded,
                    removed = summary.removed,
                    "applied server updates"
                );
            }
        }

        self.queue
            .set_last_sync_timestamp(response.new_sync_timestamp)?;

        let retention = self.config.retention.as_millis() as i64;
        if let Err(storage_err) = self.queue.purge_synced(now.saturating_sub(retention)) {
            warn!(%storage_err, "failed to purge synced items");
        }

        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.items_synced += synced as u64;
            stats.items_failed += failed as u64;
            stats.items_superseded += superseded as u64;
            stats.last_success_at = Some(response.new_sync_timestamp);
            stats.last_error = None;
        }
        info!(synced, failed, superseded, "sync cycle completed");
        Ok((synced, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::error::SyncError;
    use crate::connectivity::AtomicProbe;
    use crate::resolver::ConflictResolver;
    use crate::transport::MockTransport;
    use serde_json::json;
    use std::time::Duration;
    use tillsync_protocol::{
        BatchSyncResponse, EntityKind, Operation, ServerEntity, ServerUpdates, SyncStatus,
    };
    use tillsync_queue::MemoryStore;

    struct Fixture {
        engine: SyncEngine<MockTransport>,
        transport: Arc<MockTransport>,
        probe: Arc<AtomicProbe>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let queue = Arc::new(SyncQueue::open(MemoryStore::new()).unwrap());
        let transport = Arc::new(MockTransport::new());
        let probe = Arc::new(AtomicProbe::new(true));
        let clock = Arc::new(ManualClock::new(1_000));
        let resolver = ConflictResolver::new(Arc::clone(&queue));
        let engine = SyncEngine::new(
            config,
            queue,
            Arc::clone(&transport),
            resolver,
            Arc::clone(&probe) as Arc<dyn ConnectivityProbe>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Fixture {
            engine,
            transport,
            probe,
            clock,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(SyncConfig::new().with_retry(RetryConfig::new(3).without_jitter()))
    }

    fn enqueue(fixture: &Fixture, at: i64) -> QueueItem {
        fixture
            .engine
            .queue()
            .enqueue(EntityKind::Order, Operation::Insert, json!({"t": at}), at)
            .unwrap()
    }

    #[test]
    fn offline_skips_without_state_change() {
        let f = default_fixture();
        enqueue(&f, 10);
        f.probe.set_online(false);

        let receiver = f.engine.subscribe();
        assert_eq!(f.engine.try_sync().unwrap(), CycleOutcome::SkippedOffline);
        assert!(receiver.try_recv().is_err());
        assert_eq!(f.transport.request_count(), 0);
    }

    #[test]
    fn empty_queue_skips_without_state_change() {
        let f = default_fixture();
        let receiver = f.engine.subscribe();

        assert_eq!(f.engine.try_sync().unwrap(), CycleOutcome::SkippedEmpty);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn successful_cycle_applies_outcomes_and_checkpoint() {
        let f = default_fixture();
        let a = enqueue(&f, 10);
        let b = enqueue(&f, 20);
        f.transport.queue_response(BatchSyncResponse::new(
            vec![
                ItemResult::success(a.id),
                ItemResult::rejected(b.id, "stock rejected"),
            ],
            5_000,
        ));

        let receiver = f.engine.subscribe();
        let outcome = f.engine.try_sync().unwrap();

        assert_eq!(
            outcome,
            CycleOutcome::Completed {
                synced: 1,
                failed: 1
            }
        );
        let queue = f.engine.queue();
        assert_eq!(queue.get(a.id).unwrap().sync_status, SyncStatus::Synced);
        assert_eq!(queue.get(b.id).unwrap().sync_status, SyncStatus::Failed);
        assert_eq!(queue.last_sync_timestamp(), Some(5_000));

        assert_eq!(receiver.recv().unwrap(), SyncState::Syncing);
        assert_eq!(
            receiver.recv().unwrap(),
            SyncState::Success {
                synced: 1,
                failed: 1
            }
        );
        assert_eq!(receiver.recv().unwrap(), SyncState::Idle);

        let stats = f.engine.stats();
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.items_synced, 1);
        assert_eq!(stats.items_failed, 1);
    }

    #[test]
    fn batch_preserves_creation_order() {
        let f = default_fixture();
        let late = enqueue(&f, 30);
        let early = enqueue(&f, 10);
        f.transport.queue_response(BatchSyncResponse::new(
            vec![ItemResult::success(early.id), ItemResult::success(late.id)],
            100,
        ));

        f.engine.try_sync().unwrap();

        let request = &f.transport.requests()[0];
        assert_eq!(request.items[0].id, early.id);
        assert_eq!(request.items[1].id, late.id);
    }

    #[test]
    fn transport_failure_marks_batch_failed_and_surfaces_error() {
        let f = default_fixture();
        let item = enqueue(&f, 10);
        f.transport.queue_transport_error("connection refused");

        let receiver = f.engine.subscribe();
        let err = f.engine.try_sync().unwrap_err();
        assert!(err.is_retryable());

        let stored = f.engine.queue().get(item.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(stored.retry_count, 1);

        assert_eq!(receiver.recv().unwrap(), SyncState::Syncing);
        assert!(matches!(receiver.recv().unwrap(), SyncState::Error(_)));
        assert_eq!(receiver.recv().unwrap(), SyncState::Idle);
        assert!(f.engine.stats().last_error.is_some());
    }

    #[test]
    fn timeout_fails_batch_like_any_transport_error() {
        let f = default_fixture();
        let item = enqueue(&f, 10);
        f.transport.queue_timeout();

        let receiver = f.engine.subscribe();
        let err = f.engine.try_sync().unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
        assert!(err.is_retryable());

        let stored = f.engine.queue().get(item.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("operation timed out"));
        assert_eq!(stored.retry_count, 1);

        assert_eq!(receiver.recv().unwrap(), SyncState::Syncing);
        assert_eq!(
            receiver.recv().unwrap(),
            SyncState::Error("operation timed out".into())
        );
        assert_eq!(receiver.recv().unwrap(), SyncState::Idle);
    }

    #[test]
    fn missing_outcome_is_a_failure() {
        let f = default_fixture();
        let answered = enqueue(&f, 10);
        let orphaned = enqueue(&f, 20);
        // Response covers only one of the two submitted items.
        f.transport.queue_response(BatchSyncResponse::new(
            vec![ItemResult::success(answered.id)],
            100,
        ));

        let outcome = f.engine.try_sync().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Completed {
                synced: 1,
                failed: 1
            }
        );

        let stored = f.engine.queue().get(orphaned.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("no outcome returned for item")
        );
    }

    #[test]
    fn rejected_batch_fails_every_item() {
        let f = default_fixture();
        let item = enqueue(&f, 10);
        let mut response = BatchSyncResponse::new(vec![ItemResult::success(item.id)], 100);
        response.success = false;
        f.transport.queue_response(response);

        let outcome = f.engine.try_sync().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Completed {
                synced: 0,
                failed: 1
            }
        );
        assert_eq!(
            f.engine.queue().get(item.id).unwrap().sync_status,
            SyncStatus::Failed
        );
    }

    #[test]
    fn failed_item_waits_out_its_backoff() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_secs(30))
            .without_jitter();
        let f = fixture(SyncConfig::new().with_retry(retry));
        let item = enqueue(&f, 10);

        f.transport.queue_transport_error("link down");
        f.engine.try_sync().unwrap_err();
        assert_eq!(f.engine.queue().get(item.id).unwrap().retry_count, 1);

        // Still inside the 30s backoff window.
        f.clock.advance(10_000);
        assert_eq!(f.engine.try_sync().unwrap(), CycleOutcome::SkippedEmpty);

        f.clock.advance(25_000);
        f.transport
            .queue_response(BatchSyncResponse::new(vec![ItemResult::success(item.id)], 100));
        assert_eq!(
            f.engine.try_sync().unwrap(),
            CycleOutcome::Completed {
                synced: 1,
                failed: 0
            }
        );
    }

    #[test]
    fn retry_ceiling_parks_item() {
        let retry = RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .without_jitter();
        let f = fixture(SyncConfig::new().with_retry(retry));
        let item = enqueue(&f, 10);

        for _ in 0..2 {
            f.transport.queue_transport_error("down");
            f.engine.try_sync().unwrap_err();
            f.clock.advance(60_000);
        }

        // Two failures hit the ceiling; no further request goes out.
        assert_eq!(f.engine.try_sync().unwrap(), CycleOutcome::SkippedEmpty);
        assert_eq!(f.transport.request_count(), 2);

        f.engine.queue().reset_failed().unwrap();
        f.transport
            .queue_response(BatchSyncResponse::new(vec![ItemResult::success(item.id)], 100));
        assert!(matches!(
            f.engine.try_sync().unwrap(),
            CycleOutcome::Completed { synced: 1, .. }
        ));
    }

    #[test]
    fn batch_size_caps_selection() {
        let f = fixture(
            SyncConfig::new()
                .with_batch_size(2)
                .with_retry(RetryConfig::new(3).without_jitter()),
        );
        let a = enqueue(&f, 10);
        let b = enqueue(&f, 20);
        let _c = enqueue(&f, 30);

        f.transport.queue_response(BatchSyncResponse::new(
            vec![ItemResult::success(a.id), ItemResult::success(b.id)],
            100,
        ));

        f.engine.try_sync().unwrap();
        let request = &f.transport.requests()[0];
        assert_eq!(request.items.len(), 2);
        assert_eq!(f.engine.queue().counts().pending, 1);
    }

    #[test]
    fn server_updates_supersede_local_items() {
        // batch_size 1 keeps the conflicting item out of this cycle.
        let f = fixture(
            SyncConfig::new()
                .with_batch_size(1)
                .with_retry(RetryConfig::new(3).without_jitter()),
        );
        let sent = enqueue(&f, 10);
        let conflict = f
            .engine
            .queue()
            .enqueue(
                EntityKind::CustomerUpdate,
                Operation::Update,
                json!({"name": "local"}),
                20,
            )
            .unwrap();

        f.transport.queue_response(
            BatchSyncResponse::new(vec![ItemResult::success(sent.id)], 100).with_server_updates(
                ServerUpdates {
                    updated: vec![ServerEntity {
                        entity_kind: EntityKind::CustomerUpdate,
                        id: conflict.id,
                        payload: json!({"name": "server"}),
                    }],
                    deleted_ids: vec![],
                },
            ),
        );

        f.engine.try_sync().unwrap();

        // The conflicting item was never transmitted and is now synced.
        assert_eq!(
            f.engine.queue().get(conflict.id).unwrap().sync_status,
            SyncStatus::Synced
        );
        assert_eq!(f.transport.request_count(), 1);
        assert_eq!(f.engine.stats().items_superseded, 1);
    }

    #[test]
    fn purge_runs_after_successful_cycle() {
        let f = fixture(
            SyncConfig::new()
                .with_retention(Duration::from_millis(100))
                .with_retry(RetryConfig::new(3).without_jitter()),
        );
        let item = enqueue(&f, 10);
        f.transport
            .queue_response(BatchSyncResponse::new(vec![ItemResult::success(item.id)], 50));
        f.engine.try_sync().unwrap();
        assert!(f.engine.queue().get(item.id).is_some());

        // Far past the retention window on the next cycle.
        f.clock.set(1_000_000);
        let fresh = enqueue(&f, 999_000);
        f.transport
            .queue_response(BatchSyncResponse::new(vec![ItemResult::success(fresh.id)], 60));
        f.engine.try_sync().unwrap();

        assert!(f.engine.queue().get(item.id).is_none());
        assert!(f.engine.queue().get(fresh.id).is_some());
    }

    #[test]
    fn concurrent_trigger_reports_busy() {
        use std::sync::mpsc;

        // A transport that parks until released, holding the cycle open.
        struct BlockingTransport {
            entered: mpsc::Sender<()>,
            release: std::sync::Mutex<mpsc::Receiver<()>>,
        }

        impl SyncTransport for BlockingTransport {
            fn send(&self, request: &BatchSyncRequest) -> SyncResult<BatchSyncResponse> {
                self.entered.send(()).ok();
                self.release.lock().unwrap().recv().ok();
                Ok(BatchSyncResponse::new(
                    request
                        .items
                        .iter()
                        .map(|item| ItemResult::success(item.id))
                        .collect(),
                    100,
                ))
            }
        }

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let queue = Arc::new(SyncQueue::open(MemoryStore::new()).unwrap());
        queue
            .enqueue(EntityKind::Order, Operation::Insert, json!({}), 10)
            .unwrap();
        let resolver = ConflictResolver::new(Arc::clone(&queue));
        let engine = Arc::new(SyncEngine::new(
            SyncConfig::new().with_retry(RetryConfig::new(3).without_jitter()),
            queue,
            Arc::new(BlockingTransport {
                entered: entered_tx,
                release: std::sync::Mutex::new(release_rx),
            }),
            resolver,
            Arc::new(AtomicProbe::new(true)) as Arc<dyn ConnectivityProbe>,
            Arc::new(ManualClock::new(1_000)) as Arc<dyn Clock>,
        ));

        let background = Arc::clone(&engine);
        let handle = std::thread::spawn(move || background.try_sync());

        // Wait until the first cycle is inside the transport, then race.
        entered_rx.recv().unwrap();
        assert_eq!(engine.try_sync().unwrap(), CycleOutcome::Busy);

        release_tx.send(()).unwrap();
        assert!(matches!(
            handle.join().unwrap().unwrap(),
            CycleOutcome::Completed { synced: 1, .. }
        ));
        // The gate is released after the cycle ends.
        assert_eq!(engine.try_sync().unwrap(), CycleOutcome::SkippedEmpty);
    }

    #[test]
    fn report_reflects_queue_and_state() {
        let f = default_fixture();
        enqueue(&f, 10);

        let report = f.engine.report();
        assert_eq!(report.counts.pending, 1);
        assert_eq!(report.last_sync_timestamp, None);
        assert_eq!(report.state, SyncState::Idle);
    }
}
