//! Transport layer abstraction for batch sync.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tillsync_protocol::{BatchSyncRequest, BatchSyncResponse};

/// A sync transport performs the batch round trip with the remote.
///
/// One call transmits the whole batch; the protocol never does one
/// request per item. Implementations must distinguish transport-level
/// failures (timeout, connection refused, non-2xx) from per-item
/// rejections, which arrive inside a successful response.
pub trait SyncTransport: Send + Sync {
    /// Sends a batch request and returns the remote's response.
    fn send(&self, request: &BatchSyncRequest) -> SyncResult<BatchSyncResponse>;
}

/// A mock transport for testing.
///
/// Responses are scripted in FIFO order; every request is captured for
/// later inspection.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<SyncResult<BatchSyncResponse>>>,
    requests: Mutex<Vec<BatchSyncRequest>>,
}

impl MockTransport {
    /// Creates a new mock transport with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful response.
    pub fn queue_response(&self, response: BatchSyncResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a retryable transport failure.
    pub fn queue_transport_error(&self, message: impl Into<String>) {
        self.responses
            .lock()
            .push_back(Err(SyncError::transport_retryable(message)));
    }

    /// Queues a timeout.
    pub fn queue_timeout(&self) {
        self.responses.lock().push_back(Err(SyncError::Timeout));
    }

    /// Returns all requests sent so far.
    pub fn requests(&self) -> Vec<BatchSyncRequest> {
        self.requests.lock().clone()
    }

    /// Returns the number of requests sent so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl SyncTransport for MockTransport {
    fn send(&self, request: &BatchSyncRequest) -> SyncResult<BatchSyncResponse> {
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Protocol("no mock response set".into())))
    }
}
