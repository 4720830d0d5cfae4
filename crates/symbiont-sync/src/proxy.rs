//! Proxy-side request correlation.
//!
//! The channel delivers responses in whatever order the owner produces
//! them, so each call registers a one-shot slot under a fresh `requestId`
//! before posting, and a reader task routes every inbound response to the
//! slot with the matching id. A slot is removed on response, on timeout,
//! on a failed post, or when the calling future is dropped; abandoned
//! requests never accumulate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rand::Rng as _;
use rand::distr::Alphanumeric;
use serde::de::DeserializeOwned;
use serde_json::Value;
use symbiont_types::{StorageCommand, StorageResponse};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{ProxyEndpoint, Transport};
use crate::error::StorageError;

/// Length of the random suffix of a request id.
const REQUEST_ID_SUFFIX_LEN: usize = 9;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<StorageResponse>>>>;

/// Generate a request id: millisecond timestamp, `-`, random alphanumerics.
pub fn new_request_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(REQUEST_ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}-{suffix}", Utc::now().timestamp_millis())
}

/// Sends storage commands to the owner and awaits the matching responses.
pub struct ProxyClient {
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    timeout: Duration,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_count())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ProxyClient {
    /// Start routing responses from `endpoint`; calls give up after `timeout`.
    pub fn new(endpoint: ProxyEndpoint, timeout: Duration) -> Self {
        let pending = PendingMap::default();
        let reader = tokio::spawn(route_responses(endpoint.responses, Arc::clone(&pending)));
        Self {
            transport: endpoint.transport,
            pending,
            timeout,
            reader,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send `command` and decode the response data as `T`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Channel`] if the request could not be posted or the
    ///   response stream closed.
    /// - [`StorageError::Timeout`] if no response arrived in time.
    /// - [`StorageError::Remote`] if the owner reported a failure.
    /// - [`StorageError::Serialization`] if the data does not decode as `T`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        command: StorageCommand,
    ) -> Result<T, StorageError> {
        let data = self.send(command).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Send `command` and return the raw response data.
    ///
    /// # Errors
    ///
    /// See [`ProxyClient::call`].
    pub async fn send(&self, command: StorageCommand) -> Result<Value, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        let slot = PendingSlot::register(&self.pending, tx);
        let request = command.into_request(slot.request_id.clone())?;

        debug!(
            request_id = request.request_id,
            kind = request.kind,
            "Posting storage request"
        );
        self.transport.post(&request).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response
                .into_outcome()
                .map_err(|message| StorageError::Remote { message }),
            Ok(Err(_closed)) => Err(StorageError::Channel {
                message: String::from("response stream closed"),
            }),
            Err(_elapsed) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    request_id = request.request_id,
                    kind = request.kind,
                    timeout_ms,
                    "Storage request timed out"
                );
                Err(StorageError::Timeout {
                    request_id: request.request_id,
                    timeout_ms,
                })
            }
        }
    }

    /// Refuse further calls and stop routing responses.
    ///
    /// Calls still in flight fail with [`StorageError::Channel`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.reader.abort();
            lock(&self.pending).clear();
        }
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<StorageResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registered pending request; deregisters itself when dropped.
struct PendingSlot {
    pending: PendingMap,
    request_id: String,
}

impl PendingSlot {
    fn register(pending: &PendingMap, reply: oneshot::Sender<StorageResponse>) -> Self {
        let mut map = lock(pending);
        let mut request_id = new_request_id();
        while map.contains_key(&request_id) {
            request_id = new_request_id();
        }
        map.insert(request_id.clone(), reply);
        Self {
            pending: Arc::clone(pending),
            request_id,
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.request_id);
    }
}

async fn route_responses(
    mut responses: mpsc::UnboundedReceiver<StorageResponse>,
    pending: PendingMap,
) {
    while let Some(response) = responses.recv().await {
        let slot = lock(&pending).remove(&response.request_id);
        if let Some(reply) = slot {
            let _ = reply.send(response);
            continue;
        }
        debug!(
            request_id = response.request_id,
            "Dropping response for unknown or expired request"
        );
    }
    // Stream closed: fail everything still waiting.
    lock(&pending).clear();
}
