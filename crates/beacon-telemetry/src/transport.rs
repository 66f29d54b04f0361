//! Transport primitive for the ingestion endpoint

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::error::{Result, TelemetryError};

/// Header carrying the project API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// One-shot delivery primitive: POST a batch, get a status code or an error.
///
/// Implementations know nothing about queues, stores, or retries; the
/// sender owns the retry loop and the orchestrator owns reconciliation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Post the wire-format batch. Returns the HTTP status code, or a
    /// status-less [`TelemetryError::Network`] for connection-level failures.
    async fn post(&self, batch: &[Value]) -> Result<u16>;
}

/// reqwest-backed transport with a fixed per-request timeout.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(endpoint: String, api_key: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, batch: &[Value]) -> Result<u16> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&batch)
            .send()
            .await
            .map_err(|e| TelemetryError::Network {
                status: None,
                message: e.to_string(),
            })?;
        Ok(response.status().as_u16())
    }
}
