//! Main telemetry client

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::TelemetryConfig;
use crate::dispatcher::{Command, Dispatcher, FlushOutcome, Stats};
use crate::error::{Result, TelemetryError};
use crate::event::{sanitize_event_name, sanitize_properties, Event, EventHook};
use crate::install_id::get_or_generate_install_id;
use crate::queue::BoundedQueue;
use crate::sender::BatchSender;
use crate::signals::{connectivity_channel, ConnectivityHandle, LifecycleEvent};
use crate::store::OfflineStore;
use crate::transport::HttpTransport;

/// Optional observer hooks for terminal event outcomes.
#[derive(Default, Clone)]
pub struct Hooks {
    /// Fired when the queue rejects an event at capacity.
    pub on_drop: Option<EventHook>,
    /// Fired when an event is given up past the retry ceiling.
    pub on_give_up: Option<EventHook>,
}

/// Point-in-time view of pipeline state.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub online: bool,
    pub disposed: bool,
    pub events_sent: u64,
    pub events_failed: u64,
    pub events_dropped: u64,
    pub events_given_up: u64,
    /// Rows currently held in the offline store; `None` when storage is
    /// disabled or unavailable.
    pub store_pending: Option<usize>,
}

/// Producer-facing telemetry client.
///
/// `track()` never blocks and never raises: events are staged in a bounded
/// queue, persisted off the caller's path, and delivered in batches by a
/// background worker. Delivery failures surface only through queue/store
/// state and [`health`](Self::health).
pub struct TelemetryClient {
    config: TelemetryConfig,
    dispatcher: Arc<Dispatcher>,
    commands: mpsc::UnboundedSender<Command>,
    connectivity: ConnectivityHandle,
    global_user_id: RwLock<Option<String>>,
    stats: Arc<Stats>,
    disposed: AtomicBool,
    active: bool,
}

impl TelemetryClient {
    /// Create a client. Configuration problems are fatal here and nowhere
    /// else; a disabled client constructs successfully and no-ops.
    pub async fn new(config: TelemetryConfig) -> Result<Self> {
        Self::with_hooks(config, Hooks::default()).await
    }

    /// Create a client with drop/give-up observer hooks attached.
    pub async fn with_hooks(config: TelemetryConfig, hooks: Hooks) -> Result<Self> {
        config.validate()?;

        let active = config.enabled || config.debug;
        let stats = Arc::new(Stats::default());

        let drop_stats = stats.clone();
        let user_on_drop = hooks.on_drop;
        let on_drop: EventHook = Arc::new(move |event: &Event| {
            drop_stats.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(hook) = &user_on_drop {
                hook(event);
            }
        });
        let queue = BoundedQueue::with_drop_hook(config.queue_capacity, on_drop);

        let store = if active && config.offline_storage {
            match open_store(&config) {
                Ok(store) => Some(store),
                Err(error) => {
                    warn!(%error, "offline storage unavailable, delivery is in-memory only");
                    None
                }
            }
        } else {
            None
        };

        let transport = Arc::new(HttpTransport::new(
            config.endpoint.clone(),
            config.api_key.clone(),
            config.request_timeout(),
        ));
        let sender = BatchSender::new(
            transport,
            config.max_retries,
            config.initial_backoff(),
            config.backoff_cap(),
            config.debug,
        );

        let (connectivity, online_rx) = connectivity_channel(true);
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            queue,
            store,
            sender,
            online_rx,
            hooks.on_give_up,
            stats.clone(),
        ));

        let global_user_id = if active && config.anonymous_id {
            get_or_generate_install_id().ok()
        } else {
            None
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        if active {
            let recovered = dispatcher.reload_pending().await;
            if recovered > 0 {
                debug!(recovered, "recovered offline events into the queue");
                if recovered >= config.auto_flush_threshold {
                    let _ = commands.send(Command::FlushNow);
                }
            }
            tokio::spawn(dispatcher.clone().run(command_rx));
        }

        Ok(Self {
            config,
            dispatcher,
            commands,
            connectivity,
            global_user_id: RwLock::new(global_user_id),
            stats,
            disposed: AtomicBool::new(false),
            active,
        })
    }

    /// Track one event. Fire-and-forget: sanitizes, stages in the queue,
    /// defers the durable write to the worker, and returns immediately.
    pub fn track(&self, name: &str, properties: Map<String, Value>, user_id: Option<String>) {
        if self.disposed.load(Ordering::SeqCst) || !self.active {
            return;
        }

        let (name, name_diag) = sanitize_event_name(name);
        if let Some(diag) = name_diag {
            debug!(%diag, "event name sanitized");
        }
        let (properties, prop_diag) = sanitize_properties(properties);
        if let Some(diag) = prop_diag {
            debug!(%diag, "event properties sanitized");
        }

        // User id substitution happens exactly once, here.
        let user_id = user_id.or_else(|| {
            self.global_user_id
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        });
        let event = Event::new(name, properties, user_id);

        if self.dispatcher.enqueue(event.clone()) && self.dispatcher.has_store() {
            let _ = self.commands.send(Command::Persist(event));
        }

        if self.dispatcher.queue_len() >= self.config.auto_flush_threshold {
            let _ = self.commands.send(Command::FlushNow);
        }
    }

    /// Run one full flush cycle and report its aggregate counts. Delivery
    /// failures are not errors; leftover queue state is the signal.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TelemetryError::Disposed);
        }
        if !self.active {
            return Ok(FlushOutcome::default());
        }
        Ok(self.dispatcher.flush_cycle().await)
    }

    /// Set the process-wide user id applied to subsequently created events.
    pub fn set_user_id(&self, user_id: Option<String>) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        *self
            .global_user_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = user_id;
    }

    /// Handle for the host's network-reachability callbacks.
    pub fn connectivity(&self) -> ConnectivityHandle {
        self.connectivity.clone()
    }

    /// Forward an app-lifecycle transition to the pipeline.
    pub fn notify_lifecycle(&self, event: LifecycleEvent) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Lifecycle(event));
    }

    /// Stop the pipeline: final best-effort flush, store close, and rejection
    /// of all later API calls. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        Ok(())
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            queue_size: self.dispatcher.queue_len(),
            queue_capacity: self.dispatcher.queue_capacity(),
            online: self.dispatcher.is_online(),
            disposed: self.disposed.load(Ordering::SeqCst),
            events_sent: self.stats.sent.load(Ordering::Relaxed),
            events_failed: self.stats.failed.load(Ordering::Relaxed),
            events_dropped: self.stats.dropped.load(Ordering::Relaxed),
            events_given_up: self.stats.given_up.load(Ordering::Relaxed),
            store_pending: self.dispatcher.store_pending_count().await,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_debug(&self) -> bool {
        self.config.debug
    }
}

fn open_store(config: &TelemetryConfig) -> Result<OfflineStore> {
    let dir = config
        .resolved_storage_dir()
        .map_err(|e| TelemetryError::Storage {
            context: "resolving storage directory".to_string(),
            source: std::io::Error::other(e.to_string()),
        })?;
    let mut store = OfflineStore::new(dir);
    store.init()?;
    Ok(store)
}
