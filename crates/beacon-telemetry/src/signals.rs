//! Connectivity and app-lifecycle signal sources
//!
//! The orchestrator consumes these as injected channels and has no
//! compile-time dependency on any host framework: the embedding app owns
//! the platform hooks and forwards state here.

use std::sync::Arc;
use tokio::sync::watch;

/// Discrete app-lifecycle transitions forwarded by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// App returned to the foreground: reload pending events from the
    /// offline store. Not a send trigger.
    Foregrounded,
    /// App moved to the background: flush now.
    Backgrounded,
    /// App is about to terminate: flush now.
    Terminated,
}

/// Host-facing handle for reporting network availability.
///
/// The pipeline reacts to edge transitions only; repeated `set_online(true)`
/// calls are harmless.
#[derive(Clone)]
pub struct ConnectivityHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityHandle {
    pub fn set_online(&self, online: bool) {
        let _ = self.tx.send(online);
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

pub(crate) fn connectivity_channel(
    initially_online: bool,
) -> (ConnectivityHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(initially_online);
    (ConnectivityHandle { tx: Arc::new(tx) }, rx)
}
