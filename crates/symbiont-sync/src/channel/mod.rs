//! The message channel connecting execution contexts.
//!
//! Contexts share no memory; all they have is an asynchronous channel that
//! carries JSON messages. The coordinator only relies on three seams:
//!
//! - [`Transport`] -- a proxy posts a [`StorageRequest`] toward the owner.
//! - [`ProxyEndpoint::responses`] -- the proxy's inbound stream of
//!   [`StorageResponse`]s, in whatever order the owner produced them.
//! - [`MessageHandler`] -- the owner's listener, offered every message on the
//!   channel together with a single-use [`Reply`] handle.
//!
//! [`Channel`] ties them together. Two implementations exist: the in-process
//! [`MemoryChannel`] hub and [`NatsChannel`] for multi-process deployments.

pub mod memory;
pub mod nats;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use symbiont_types::{StorageRequest, StorageResponse};
use tokio::sync::mpsc;

use crate::error::StorageError;

pub use memory::MemoryChannel;
pub use nats::NatsChannel;

/// Outbound half of a proxy's connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand `request` to the channel.
    ///
    /// Success means the channel accepted the message, not that the owner
    /// answered. An `Err` means the request certainly did not go out.
    async fn post(&self, request: &StorageRequest) -> Result<(), StorageError>;
}

/// A proxy's connection to the owner.
pub struct ProxyEndpoint {
    /// Outbound requests.
    pub transport: Arc<dyn Transport>,
    /// Inbound responses.
    pub responses: mpsc::UnboundedReceiver<StorageResponse>,
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint").finish_non_exhaustive()
    }
}

/// Single-use handle for answering one message.
///
/// Sending consumes the handle, so a message can be answered at most once.
/// Dropping it without sending leaves the sender to time out.
pub struct Reply {
    send: Box<dyn FnOnce(StorageResponse) + Send>,
}

impl Reply {
    /// Wrap the channel-specific delivery of one response.
    pub fn new(send: impl FnOnce(StorageResponse) + Send + 'static) -> Self {
        Self {
            send: Box::new(send),
        }
    }

    /// Deliver `response` to the sender of the message.
    pub fn send(self, response: StorageResponse) {
        (self.send)(response);
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply").finish_non_exhaustive()
    }
}

/// A listener offered every message that crosses the channel.
pub trait MessageHandler: Send + Sync {
    /// Inspect `message` and decide whether to answer it.
    ///
    /// Returning `true` claims the message: the handler takes ownership of
    /// `reply` and will send on it later. Returning `false` leaves the
    /// message to other listeners; `reply` is dropped unused.
    fn on_message(&self, message: &Value, reply: Reply) -> bool;
}

/// Keeps an owner listener attached to the channel.
///
/// Dropping the registration (or calling [`Registration::unregister`])
/// detaches the listener.
pub struct Registration {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Registration {
    /// Wrap the channel-specific detach action.
    pub fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Detach the listener now.
    pub fn unregister(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// A message channel that proxies connect to and owners listen on.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Open a proxy connection with its own response stream.
    async fn connect_proxy(&self) -> Result<ProxyEndpoint, StorageError>;

    /// Attach an owner listener.
    async fn register_owner(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Registration, StorageError>;
}
