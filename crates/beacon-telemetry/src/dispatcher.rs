//! Flush orchestration and the delivery worker
//!
//! A single background task consumes every flush trigger (timer, queue
//! threshold, connectivity edges, lifecycle, explicit flush), so batch sends
//! are never issued concurrently. The flush gate collapses overlapping
//! triggers into one active cycle; the public `flush()` path waits on the
//! gate instead, so it always observes a complete cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::event::{Event, EventHook, EventStatus};
use crate::queue::BoundedQueue;
use crate::sender::BatchSender;
use crate::signals::LifecycleEvent;
use crate::store::OfflineStore;

/// Work items handed to the delivery worker.
pub(crate) enum Command {
    /// Write one event to the offline store, off the `track()` path.
    Persist(Event),
    /// Queue crossed the auto-flush threshold.
    FlushNow,
    Lifecycle(LifecycleEvent),
    /// Final flush, store close, loop exit; acked when done.
    Shutdown(oneshot::Sender<()>),
}

/// Lifetime counters surfaced through the health snapshot.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
    pub given_up: AtomicU64,
}

/// Aggregate result of one flush cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Events confirmed delivered this cycle.
    pub sent: usize,
    /// Events that failed and were requeued for a later cycle.
    pub failed: usize,
    /// Events purged after exceeding the retry ceiling.
    pub gave_up: usize,
}

pub(crate) struct Dispatcher {
    queue: StdMutex<BoundedQueue>,
    store: Option<AsyncMutex<OfflineStore>>,
    sender: BatchSender,
    max_batch_size: usize,
    retry_ceiling: u32,
    flush_interval: Duration,
    online_rx: watch::Receiver<bool>,
    flush_gate: AsyncMutex<()>,
    on_give_up: Option<EventHook>,
    stats: Arc<Stats>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: &TelemetryConfig,
        queue: BoundedQueue,
        store: Option<OfflineStore>,
        sender: BatchSender,
        online_rx: watch::Receiver<bool>,
        on_give_up: Option<EventHook>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            queue: StdMutex::new(queue),
            store: store.map(AsyncMutex::new),
            sender,
            max_batch_size: config.max_batch_size,
            retry_ceiling: config.retry_ceiling,
            flush_interval: config.flush_interval(),
            online_rx,
            flush_gate: AsyncMutex::new(()),
            on_give_up,
            stats,
        }
    }

    pub(crate) fn lock_queue(&self) -> MutexGuard<'_, BoundedQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enqueue(&self, event: Event) -> bool {
        self.lock_queue().enqueue(event)
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    pub(crate) fn queue_capacity(&self) -> usize {
        self.lock_queue().capacity()
    }

    pub(crate) fn is_online(&self) -> bool {
        *self.online_rx.borrow()
    }

    pub(crate) fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub(crate) async fn store_pending_count(&self) -> Option<usize> {
        match &self.store {
            Some(store) => store.lock().await.count().ok(),
            None => None,
        }
    }

    /// Persist events, degrading to in-memory-only on storage failure.
    pub(crate) async fn persist_many(&self, events: &[Event]) {
        let Some(store) = &self.store else {
            return;
        };
        let store = store.lock().await;
        if let Err(error) = store.save_many(events) {
            warn!(%error, count = events.len(), "offline persist failed, events held in-memory only");
        }
    }

    async fn delete_from_store(&self, events: &[Event]) {
        let Some(store) = &self.store else {
            return;
        };
        let store = store.lock().await;
        if let Err(error) = store.delete_many(events.iter().map(|e| e.id.as_str())) {
            warn!(%error, "offline delete failed");
        }
    }

    /// Reseed the queue from the offline store (startup and foreground).
    /// Rows already present in the queue are left untouched. Returns the
    /// number of events enqueued.
    pub(crate) async fn reload_pending(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let loaded = {
            let store = store.lock().await;
            match store.load_pending(None) {
                Ok(events) => events,
                Err(error) => {
                    warn!(%error, "failed to reload offline events");
                    return 0;
                }
            }
        };
        if loaded.is_empty() {
            return 0;
        }

        let mut queue = self.lock_queue();
        let fresh: Vec<Event> = loaded
            .into_iter()
            .filter(|event| !queue.contains(&event.id))
            .collect();
        queue.enqueue_many(fresh)
    }

    /// Run one full flush cycle, waiting out any cycle already in flight.
    pub(crate) async fn flush_cycle(&self) -> FlushOutcome {
        let _guard = self.flush_gate.lock().await;
        self.run_cycle().await
    }

    /// Trigger-path flush: overlapping triggers collapse into the active
    /// cycle instead of queueing up behind it.
    pub(crate) async fn try_flush_cycle(&self) -> Option<FlushOutcome> {
        match self.flush_gate.try_lock() {
            Ok(_guard) => Some(self.run_cycle().await),
            Err(_) => {
                debug!("flush already in progress, trigger collapsed");
                None
            }
        }
    }

    async fn run_cycle(&self) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        if !self.is_online() {
            debug!("offline, skipping flush cycle");
            return outcome;
        }

        loop {
            let mut batch = self.lock_queue().dequeue_batch(self.max_batch_size);
            if batch.is_empty() {
                break;
            }

            if self.sender.send(&mut batch).await {
                self.delete_from_store(&batch).await;
                outcome.sent += batch.len();
            } else {
                self.handle_batch_failure(batch, &mut outcome).await;
                // One bad batch halts the whole pass: server courtesy over
                // throughput while the endpoint is unreachable.
                break;
            }
        }

        self.stats.sent.fetch_add(outcome.sent as u64, Ordering::Relaxed);
        self.stats.failed.fetch_add(outcome.failed as u64, Ordering::Relaxed);
        self.stats.given_up.fetch_add(outcome.gave_up as u64, Ordering::Relaxed);
        if outcome != FlushOutcome::default() {
            info!(
                sent = outcome.sent,
                failed = outcome.failed,
                gave_up = outcome.gave_up,
                "flush cycle complete"
            );
        }
        outcome
    }

    /// Failed-batch reconciliation. Events past the retry ceiling are given
    /// up: purged from queue and store and reported through the hook.
    /// Survivors go back to the queue front in their original order and are
    /// re-persisted with their bumped retry counts.
    async fn handle_batch_failure(&self, batch: Vec<Event>, outcome: &mut FlushOutcome) {
        let (expired, mut survivors): (Vec<Event>, Vec<Event>) = batch
            .into_iter()
            .partition(|event| event.retry_count > self.retry_ceiling);

        for event in survivors.iter_mut() {
            event.status = EventStatus::Pending;
        }
        self.persist_many(&survivors).await;
        outcome.failed += survivors.len();
        self.lock_queue().requeue_many_front(survivors);

        if !expired.is_empty() {
            self.delete_from_store(&expired).await;
            outcome.gave_up += expired.len();
            for event in &expired {
                warn!(
                    event_id = %event.id,
                    event_name = %event.name,
                    retries = event.retry_count,
                    "giving up on event past retry ceiling"
                );
                if let Some(hook) = &self.on_give_up {
                    hook(event);
                }
            }
        }
    }

    async fn handle_lifecycle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Foregrounded => {
                let reloaded = self.reload_pending().await;
                if reloaded > 0 {
                    debug!(reloaded, "reloaded pending events on foreground");
                }
            }
            LifecycleEvent::Backgrounded | LifecycleEvent::Terminated => {
                self.try_flush_cycle().await;
            }
        }
    }

    async fn finalize(&self) {
        // Waits for any in-flight cycle, then makes one best-effort pass.
        self.flush_cycle().await;
        if let Some(store) = &self.store {
            store.lock().await.close();
        }
        debug!("delivery worker stopped");
    }

    /// Background worker loop: the single consumer of all flush triggers.
    pub(crate) async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Command>) {
        // First tick lands one full interval after startup; recovery sends
        // are driven by the threshold and connectivity triggers instead.
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut online_rx = self.online_rx.clone();
        let mut was_online = *online_rx.borrow();
        let mut connectivity_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.try_flush_cycle().await;
                }
                changed = online_rx.changed(), if connectivity_open => {
                    match changed {
                        Ok(()) => {
                            let now_online = *online_rx.borrow_and_update();
                            if now_online && !was_online {
                                debug!("connectivity restored, flushing");
                                self.try_flush_cycle().await;
                            }
                            was_online = now_online;
                        }
                        Err(_) => {
                            // Every connectivity handle is gone; stop
                            // watching for edges.
                            connectivity_open = false;
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(Command::Persist(event)) => self.persist_many(&[event]).await,
                        Some(Command::FlushNow) => {
                            self.try_flush_cycle().await;
                        }
                        Some(Command::Lifecycle(event)) => self.handle_lifecycle(event).await,
                        Some(Command::Shutdown(ack)) => {
                            self.finalize().await;
                            let _ = ack.send(());
                            break;
                        }
                        None => {
                            // Client dropped without dispose; still drain.
                            self.finalize().await;
                            break;
                        }
                    }
                }
            }
        }
    }
}
