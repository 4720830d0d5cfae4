//! In-process message hub.
//!
//! [`MemoryChannel`] behaves like a browser extension's runtime messaging:
//! every message is offered to every attached listener, a post with no
//! listener to claim it fails immediately, and replies travel back only to
//! the proxy that sent the request. Messages are round-tripped through JSON
//! so the hub exercises the same wire shapes as a real transport.
//!
//! The hub can be made unreachable to simulate an owner that goes away:
//! new posts fail at once and replies already in progress are dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::Value;
use symbiont_types::{StorageRequest, StorageResponse};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Channel, MessageHandler, ProxyEndpoint, Registration, Reply, Transport};
use crate::error::StorageError;

type Listeners = Vec<(u64, Arc<dyn MessageHandler>)>;

#[derive(Default)]
struct Hub {
    listeners: Mutex<Listeners>,
    next_listener: AtomicU64,
    unreachable: AtomicBool,
}

impl Hub {
    fn reachable(&self) -> bool {
        !self.unreachable.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Listeners {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn detach(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(listener, _)| *listener != id);
    }

    /// Offer `message` to each listener until one claims it.
    fn offer(
        self: &Arc<Self>,
        message: &Value,
        responses: Option<&mpsc::UnboundedSender<StorageResponse>>,
    ) -> bool {
        for (_, listener) in self.snapshot() {
            let hub = Arc::downgrade(self);
            let responses = responses.cloned();
            let reply = Reply::new(move |response| {
                deliver_reply(&hub, responses.as_ref(), response);
            });
            if listener.on_message(message, reply) {
                return true;
            }
        }
        false
    }
}

fn deliver_reply(
    hub: &Weak<Hub>,
    responses: Option<&mpsc::UnboundedSender<StorageResponse>>,
    response: StorageResponse,
) {
    let reachable = hub.upgrade().is_some_and(|hub| hub.reachable());
    if !reachable {
        debug!(request_id = response.request_id, "Hub unreachable, reply dropped");
        return;
    }
    let Some(responses) = responses else {
        return;
    };
    if responses.send(response).is_err() {
        debug!("Proxy disconnected before its reply arrived");
    }
}

/// In-process message channel shared by every context of a test or demo.
///
/// Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    hub: Arc<Hub>,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("listeners", &self.listener_count())
            .field("reachable", &self.hub.reachable())
            .finish()
    }
}

impl MemoryChannel {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attached owner listeners.
    pub fn listener_count(&self) -> usize {
        self.hub
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Make the hub (un)reachable. While unreachable, posts fail and replies
    /// are dropped.
    pub fn set_reachable(&self, reachable: bool) {
        self.hub.unreachable.store(!reachable, Ordering::Release);
    }

    /// Broadcast an arbitrary message to the listeners, without a way to
    /// answer it. Returns whether a listener claimed it.
    pub fn broadcast(&self, message: &Value) -> bool {
        self.hub.offer(message, None)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn connect_proxy(&self) -> Result<ProxyEndpoint, StorageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(ProxyEndpoint {
            transport: Arc::new(MemoryTransport {
                hub: Arc::clone(&self.hub),
                responses: tx,
            }),
            responses: rx,
        })
    }

    async fn register_owner(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Registration, StorageError> {
        let id = self.hub.next_listener.fetch_add(1, Ordering::Relaxed);
        self.hub
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        debug!(listener = id, "Owner listener attached");

        let hub = Arc::downgrade(&self.hub);
        Ok(Registration::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.detach(id);
                debug!(listener = id, "Owner listener detached");
            }
        }))
    }
}

struct MemoryTransport {
    hub: Arc<Hub>,
    responses: mpsc::UnboundedSender<StorageResponse>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn post(&self, request: &StorageRequest) -> Result<(), StorageError> {
        if !self.hub.reachable() {
            return Err(StorageError::Channel {
                message: String::from("owner context is unreachable"),
            });
        }
        let message = serde_json::to_value(request)?;
        if self.hub.offer(&message, Some(&self.responses)) {
            Ok(())
        } else {
            warn!(
                request_id = request.request_id,
                kind = request.kind,
                "No listener claimed storage request"
            );
            Err(StorageError::Channel {
                message: String::from(
                    "could not establish connection: receiving end does not exist",
                ),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Answers every message immediately with its own request id.
    struct Echo;

    impl MessageHandler for Echo {
        fn on_message(&self, message: &Value, reply: Reply) -> bool {
            let Some(id) = message.get("requestId").and_then(Value::as_str) else {
                return false;
            };
            reply.send(StorageResponse::ok(id, message.clone()));
            true
        }
    }

    fn request(id: &str) -> StorageRequest {
        StorageRequest {
            kind: String::from("STORAGE_PING"),
            payload: None,
            request_id: String::from(id),
        }
    }

    #[tokio::test]
    async fn post_without_listener_fails() {
        let channel = MemoryChannel::new();
        let endpoint = channel.connect_proxy().await.unwrap();
        let result = endpoint.transport.post(&request("r1")).await;
        assert!(matches!(result, Err(StorageError::Channel { .. })));
    }

    #[tokio::test]
    async fn replies_reach_only_the_sender() {
        let channel = MemoryChannel::new();
        let _registration = channel.register_owner(Arc::new(Echo)).await.unwrap();
        let mut first = channel.connect_proxy().await.unwrap();
        let mut second = channel.connect_proxy().await.unwrap();

        first.transport.post(&request("r1")).await.unwrap();
        let reply = first.responses.recv().await.unwrap();
        assert_eq!(reply.request_id, "r1");
        assert!(second.responses.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_registration_detaches() {
        let channel = MemoryChannel::new();
        let registration = channel.register_owner(Arc::new(Echo)).await.unwrap();
        assert_eq!(channel.listener_count(), 1);
        drop(registration);
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_hub_rejects_posts() {
        let channel = MemoryChannel::new();
        let _registration = channel.register_owner(Arc::new(Echo)).await.unwrap();
        let endpoint = channel.connect_proxy().await.unwrap();
        channel.set_reachable(false);
        let result = endpoint.transport.post(&request("r1")).await;
        assert!(matches!(result, Err(StorageError::Channel { .. })));
    }

    #[tokio::test]
    async fn broadcast_reports_claims() {
        let channel = MemoryChannel::new();
        assert!(!channel.broadcast(&json!({"requestId": "x"})));
        let _registration = channel.register_owner(Arc::new(Echo)).await.unwrap();
        assert!(channel.broadcast(&json!({"requestId": "x"})));
        assert!(!channel.broadcast(&json!({"type": "TAB_CHANGED"})));
    }
}
