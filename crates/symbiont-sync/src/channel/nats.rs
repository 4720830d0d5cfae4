//! NATS-backed message channel for multi-process deployments.
//!
//! # Subject Convention
//!
//! - **Requests:** `{prefix}.{type}`, e.g. `symbiont.storage.STORAGE_GET_ORGANISM`
//! - **Owner subscription:** `{prefix}.>`
//! - **Responses:** each proxy connection's private inbox, passed as the
//!   NATS reply subject of every request it publishes.
//!
//! NATS does not report whether anyone is listening on a plain publish, so a
//! request to an absent owner surfaces as a timeout on the proxy side.

use std::sync::Arc;

use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt as _;
use serde_json::Value;
use symbiont_types::{StorageRequest, StorageResponse};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Channel, MessageHandler, ProxyEndpoint, Registration, Reply, Transport};
use crate::error::StorageError;

/// Message channel over a NATS connection.
#[derive(Debug, Clone)]
pub struct NatsChannel {
    client: Client,
    prefix: String,
}

impl NatsChannel {
    /// Create a channel from an existing client.
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    /// Connect to a NATS server and create a channel.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Channel`] if the connection fails.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StorageError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| StorageError::Channel {
                message: format!("failed to connect to NATS at {url}: {e}"),
            })?;
        info!(url, "Connected to NATS");
        Ok(Self::new(client, prefix))
    }

    fn request_subject(&self, kind: &str) -> String {
        format!("{}.{kind}", self.prefix)
    }
}

#[async_trait]
impl Channel for NatsChannel {
    async fn connect_proxy(&self) -> Result<ProxyEndpoint, StorageError> {
        let inbox = self.client.new_inbox();
        let mut subscriber = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| StorageError::Channel {
                message: format!("failed to subscribe to {inbox}: {e}"),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                match serde_json::from_slice::<StorageResponse>(&msg.payload) {
                    Ok(response) => {
                        if tx.send(response).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Discarding malformed storage response"),
                }
            }
        });

        debug!(inbox, "Proxy inbox subscribed");
        Ok(ProxyEndpoint {
            transport: Arc::new(NatsTransport {
                channel: self.clone(),
                inbox,
                reader,
            }),
            responses: rx,
        })
    }

    async fn register_owner(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Registration, StorageError> {
        let subject = format!("{}.>", self.prefix);
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| StorageError::Channel {
                message: format!("failed to subscribe to {subject}: {e}"),
            })?;

        let client = self.client.clone();
        let listener = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let Some(reply_subject) = msg.reply.clone() else {
                    debug!(subject = %msg.subject, "Ignoring message without reply subject");
                    continue;
                };
                let message: Value = match serde_json::from_slice(&msg.payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(subject = %msg.subject, error = %e, "Ignoring non-JSON message");
                        continue;
                    }
                };

                let client = client.clone();
                let reply = Reply::new(move |response| {
                    tokio::spawn(async move {
                        let bytes = match serde_json::to_vec(&response) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(error = %e, "Failed to serialize storage response");
                                return;
                            }
                        };
                        if let Err(e) = client.publish(reply_subject, bytes.into()).await {
                            warn!(
                                request_id = response.request_id,
                                error = %e,
                                "Failed to publish storage response"
                            );
                        }
                    });
                });

                if !handler.on_message(&message, reply) {
                    debug!(subject = %msg.subject, "Message not claimed by owner");
                }
            }
        });

        info!(subject, "Owner listening for storage requests");
        Ok(Registration::new(move || listener.abort()))
    }
}

struct NatsTransport {
    channel: NatsChannel,
    inbox: String,
    reader: JoinHandle<()>,
}

impl Drop for NatsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn post(&self, request: &StorageRequest) -> Result<(), StorageError> {
        let subject = self.channel.request_subject(&request.kind);
        let payload = serde_json::to_vec(request)?;
        self.channel
            .client
            .publish_with_reply(subject.clone(), self.inbox.clone(), payload.into())
            .await
            .map_err(|e| StorageError::Channel {
                message: format!("failed to publish on {subject}: {e}"),
            })?;
        self.channel
            .client
            .flush()
            .await
            .map_err(|e| StorageError::Channel {
                message: format!("failed to flush NATS: {e}"),
            })
    }
}
