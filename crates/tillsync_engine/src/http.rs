//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so different
//! implementations (reqwest, ureq, a platform webview bridge) can be
//! plugged in without this crate depending on any of them.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use tillsync_protocol::{BatchSyncRequest, BatchSyncResponse};

/// HTTP client abstraction.
///
/// Implementations perform one blocking POST with the transport's
/// configured request timeout; a timed-out call returns an error like
/// any other transport failure.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with a JSON body and returns the response
    /// body. Non-2xx statuses are errors.
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// HTTP-based sync transport.
///
/// Posts the batch request as JSON to `{base_url}/sync/batch`.
/// Transport failures surface as retryable [`SyncError::Transport`];
/// malformed bodies as [`SyncError::Protocol`].
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn send(&self, request: &BatchSyncRequest) -> SyncResult<BatchSyncResponse> {
        let body = serde_json::to_vec(request)
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;

        let url = format!("{}/sync/batch", self.base_url);
        let response_body = self
            .client
            .post(&url, body)
            .map_err(SyncError::transport_retryable)?;

        serde_json::from_slice(&response_body)
            .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}")))
    }
}
