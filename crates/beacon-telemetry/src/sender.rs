//! Batch delivery with retry and exponential backoff
//!
//! The sender attempts one batch at a time and owns nothing but the attempt
//! loop: queue and store reconciliation stay with the orchestrator. Failures
//! are classified through [`TelemetryError::is_retryable`]; a non-retryable
//! response aborts immediately, a retryable one backs off and tries again
//! until the attempt budget is spent.

use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::TelemetryError;
use crate::event::{Event, EventStatus};
use crate::transport::Transport;

/// Sends one batch synchronously from the caller's perspective, with an
/// internal retry loop. Returns a plain success/failure flag.
pub struct BatchSender {
    transport: Arc<dyn Transport>,
    max_retries: u32,
    initial_backoff: Duration,
    backoff_cap: Duration,
    debug: bool,
}

impl BatchSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        max_retries: u32,
        initial_backoff: Duration,
        backoff_cap: Duration,
        debug: bool,
    ) -> Self {
        Self {
            transport,
            max_retries,
            initial_backoff,
            backoff_cap,
            debug,
        }
    }

    /// Attempt to deliver `events` as one batch. Mutates only event status
    /// and retry counts; the caller reconciles queue and store afterwards.
    pub async fn send(&self, events: &mut [Event]) -> bool {
        if events.is_empty() {
            return true;
        }

        let payload: Vec<Value> = events.iter().map(Event::to_wire).collect();

        if self.debug {
            // Debug mode inspects instead of sending.
            debug!(
                count = events.len(),
                payload = %serde_json::to_string_pretty(&payload).unwrap_or_default(),
                "debug mode: batch logged, not sent"
            );
            mark_all(events, EventStatus::Sent);
            return true;
        }

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(
                    self.initial_backoff,
                    self.backoff_cap,
                    attempt,
                ))
                .await;
            }

            mark_all(events, EventStatus::Sending);

            match self.transport.post(&payload).await {
                Ok(status) if (200..300).contains(&status) => {
                    mark_all(events, EventStatus::Sent);
                    return true;
                }
                Ok(status) => {
                    let failure = TelemetryError::Network {
                        status: Some(status),
                        message: "ingestion endpoint rejected batch".to_string(),
                    };
                    if !failure.is_retryable() {
                        warn!(status, count = events.len(), "batch rejected, not retrying");
                        return false;
                    }
                    warn!(status, attempt, "transient server failure, will retry");
                    bump_retries(events);
                }
                Err(TelemetryError::Network { message, .. }) => {
                    warn!(%message, attempt, "network failure, will retry");
                    bump_retries(events);
                }
                Err(other) => {
                    // Unclassified failures get retried, but loudly.
                    error!(error = %other, attempt, "unexpected send failure, treating as retryable");
                    bump_retries(events);
                }
            }
        }

        warn!(
            count = events.len(),
            attempts = self.max_retries + 1,
            "batch delivery failed after exhausting retries"
        );
        false
    }
}

fn mark_all(events: &mut [Event], status: EventStatus) {
    for event in events.iter_mut() {
        event.status = status;
    }
}

fn bump_retries(events: &mut [Event]) {
    for event in events.iter_mut() {
        event.retry_count += 1;
    }
}

/// Delay before retry `attempt` (1-indexed; attempt 0 never sleeps):
/// `min(cap, initial * 2^(attempt-1) * (1 + jitter))` with jitter drawn
/// uniformly from `[0, 0.2)` on every call.
pub(crate) fn backoff_delay(initial: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponential = initial.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..0.2);
    let delay_ms = (exponential * (1.0 + jitter)) as u64;
    Duration::from_millis(delay_ms.min(cap.as_millis() as u64))
}
