//! The sync service facade.
//!
//! Owns the engine and a background worker thread. The worker reacts
//! to three triggers: an explicit kick (new mutation or manual
//! request), a connectivity came-online transition, and the periodic
//! interval. All triggers funnel into the engine's single-flight gate,
//! so overlapping triggers collapse into one cycle.

use crate::connectivity::{ConnectivityMonitor, Transition};
use crate::engine::SyncEngine;
use crate::state::{SyncReport, SyncState, SyncStats};
use crate::transport::SyncTransport;
use serde_json::Value;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tillsync_protocol::{EntityKind, Operation, QueueItem};
use tillsync_queue::{StorageResult, SyncQueue};
use tracing::{debug, info, warn};

enum WorkerSignal {
    Kick,
    Stop,
}

/// Background sync service over a [`SyncEngine`].
///
/// Dropping the service stops the worker and joins it.
pub struct SyncService<T: SyncTransport + 'static> {
    engine: Arc<SyncEngine<T>>,
    sender: Sender<WorkerSignal>,
    worker: Option<JoinHandle<()>>,
}

impl<T: SyncTransport + 'static> SyncService<T> {
    /// Starts the background worker over the given engine.
    pub fn start(engine: Arc<SyncEngine<T>>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let worker_engine = Arc::clone(&engine);
        let worker = std::thread::Builder::new()
            .name("tillsync-worker".into())
            .spawn(move || run_worker(worker_engine, receiver))
            .ok();
        if worker.is_none() {
            warn!("failed to spawn sync worker; syncs must be triggered manually");
        }
        Self {
            engine,
            sender,
            worker,
        }
    }

    /// Returns the underlying engine.
    pub fn engine(&self) -> &Arc<SyncEngine<T>> {
        &self.engine
    }

    /// Returns the durable queue.
    pub fn queue(&self) -> &Arc<SyncQueue> {
        self.engine.queue()
    }

    /// Records a local mutation and kicks the worker.
    ///
    /// The mutation is durable once this returns, whatever the network
    /// is doing; the actual transmission happens on the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error only when the mutation cannot be persisted.
    pub fn enqueue_mutation(
        &self,
        entity_kind: EntityKind,
        operation: Operation,
        payload: Value,
    ) -> StorageResult<QueueItem> {
        let now = self.engine.clock().now_millis();
        let item = self
            .engine
            .queue()
            .enqueue(entity_kind, operation, payload, now)?;
        // Fire and forget: a dead worker only means the periodic path
        // is gone, the mutation itself is already safe.
        let _ = self.sender.send(WorkerSignal::Kick);
        Ok(item)
    }

    /// Records a mutation against an existing entity and kicks the
    /// worker. Updates and deletes go through here so the item carries
    /// the entity's id.
    ///
    /// # Errors
    ///
    /// Returns an error only when the mutation cannot be persisted.
    pub fn enqueue_mutation_for(
        &self,
        entity_id: uuid::Uuid,
        entity_kind: EntityKind,
        operation: Operation,
        payload: Value,
    ) -> StorageResult<QueueItem> {
        let now = self.engine.clock().now_millis();
        let item = self
            .engine
            .queue()
            .enqueue_for(entity_id, entity_kind, operation, payload, now)?;
        let _ = self.sender.send(WorkerSignal::Kick);
        Ok(item)
    }

    /// Requests a sync cycle as soon as the worker is free.
    pub fn trigger_sync_now(&self) {
        let _ = self.sender.send(WorkerSignal::Kick);
    }

    /// Moves failed items back to pending and kicks the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset cannot be persisted.
    pub fn reset_failed(&self) -> StorageResult<usize> {
        let reset = self.engine.queue().reset_failed()?;
        if reset > 0 {
            let _ = self.sender.send(WorkerSignal::Kick);
        }
        Ok(reset)
    }

    /// Returns the current sync state.
    pub fn state(&self) -> SyncState {
        self.engine.state()
    }

    /// Subscribes to sync state transitions.
    pub fn observe_sync_state(&self) -> Receiver<SyncState> {
        self.engine.subscribe()
    }

    /// Returns accumulated sync counters.
    pub fn sync_stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Builds the on-demand status report.
    pub fn report(&self) -> SyncReport {
        self.engine.report()
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// Safe mid-cycle: items left `syncing` recover to `pending` at the
    /// next queue open.
    pub fn shutdown(mut self) {
        let _ = self.sender.send(WorkerSignal::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<T: SyncTransport + 'static> Drop for SyncService<T> {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerSignal::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker<T: SyncTransport>(engine: Arc<SyncEngine<T>>, receiver: Receiver<WorkerSignal>) {
    let config = engine.config().clone();
    let monitor = ConnectivityMonitor::new(engine.probe());
    let mut last_attempt: Option<Instant> = None;
    let mut next_periodic = Instant::now() + config.sync_interval;
    info!("sync worker started");

    loop {
        match receiver.recv_timeout(config.poll_interval) {
            Ok(WorkerSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(WorkerSignal::Kick) => {
                run_cycle(&engine, "kick");
                last_attempt = Some(Instant::now());
                next_periodic = Instant::now() + config.sync_interval;
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                let came_online = monitor.poll() == Some(Transition::CameOnline);

                // A flapping link retriggers came-online repeatedly;
                // the gap keeps that from turning into a sync storm.
                let debounced = came_online
                    && last_attempt
                        .is_some_and(|at| now.duration_since(at) < config.min_sync_gap);
                if debounced {
                    debug!("came online inside min sync gap, not triggering");
                }

                if (came_online && !debounced) || now >= next_periodic {
                    run_cycle(&engine, if came_online { "came-online" } else { "periodic" });
                    last_attempt = Some(Instant::now());
                    next_periodic = Instant::now() + config.sync_interval;
                }
            }
        }
    }
    info!("sync worker stopped");
}

fn run_cycle<T: SyncTransport>(engine: &Arc<SyncEngine<T>>, trigger: &str) {
    debug!(trigger, "running sync cycle");
    if let Err(err) = engine.try_sync() {
        warn!(trigger, %err, "sync cycle failed");
    }
}
