//! # Beacon Telemetry
//!
//! Offline-resilient event delivery for Beacon clients.
//!
//! ## Delivery Guarantees
//!
//! - **Never blocks the caller**: `track()` does bounded in-memory work and
//!   defers all I/O to a background worker
//! - **At-least-once**: events are held in a durable offline log until the
//!   ingestion endpoint confirms them; a crash between send and delete may
//!   duplicate, never lose
//! - **Ordered**: batches leave in insertion order, and failed batches
//!   return to the front of the queue
//! - **Server-courteous**: exponential backoff with jitter, and one bad
//!   batch halts the flush pass instead of hammering a down endpoint
//! - **Fail Gracefully**: delivery failures are absorbed into queue/store
//!   state and the health snapshot, never raised at the call site
//!
//! ## Offline Resilience
//!
//! Pending events are persisted one row per event under
//! `~/.beacon/telemetry/outbox` and reloaded on startup or when the app
//! returns to the foreground. Disabling `offline_storage` is an explicit
//! choice to degrade to best-effort in-memory delivery.
//!
//! ## Opt-Out
//!
//! ```bash
//! # Via environment variable
//! export BEACON_TELEMETRY_DISABLED=1
//!
//! # Universal opt-out
//! export DO_NOT_TRACK=1
//!
//! # Via config file (~/.beacon/config.toml)
//! [telemetry]
//! enabled = false
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod install_id;
pub mod queue;
pub mod sender;
pub mod signals;
pub mod store;
pub mod transport;

pub use client::{HealthSnapshot, Hooks, TelemetryClient};
pub use config::{load_telemetry_config, TelemetryConfig};
pub use dispatcher::FlushOutcome;
pub use error::{Result, TelemetryError};
pub use event::{Event, EventHook, EventStatus};
pub use queue::BoundedQueue;
pub use signals::{ConnectivityHandle, LifecycleEvent};
pub use store::OfflineStore;
pub use transport::{HttpTransport, Transport};
