//! Owner-side request handling.
//!
//! [`OwnerHandler`] is the single listener the owner context attaches to the
//! message channel. It claims every message whose `type` carries the
//! storage prefix, runs the operation against the storage engine on a
//! separate task, and answers exactly once through the message's [`Reply`]
//! handle, whether the operation succeeded or not. Engine failures are
//! contained per request and never stop the handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use symbiont_store::StorageEngine;
use symbiont_types::{OwnerPresence, StorageCommand, StorageRequest, StorageResponse};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{MessageHandler, Reply};
use crate::error::StorageError;

struct Presence {
    instance_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// Answers storage requests arriving over the message channel.
///
/// Cloning is cheap; clones share the engine and the presence identity.
#[derive(Clone)]
pub struct OwnerHandler {
    engine: Arc<dyn StorageEngine>,
    presence: Arc<Presence>,
}

impl std::fmt::Debug for OwnerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerHandler")
            .field("instance_id", &self.presence.instance_id)
            .finish_non_exhaustive()
    }
}

impl OwnerHandler {
    /// Serve requests from `engine`.
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            engine,
            presence: Arc::new(Presence {
                instance_id: Uuid::new_v4().to_string(),
                started_at: Utc::now(),
                started: Instant::now(),
            }),
        }
    }

    /// Random identity of this owner, fixed for its lifetime.
    pub fn instance_id(&self) -> &str {
        &self.presence.instance_id
    }

    /// What this owner reports to a presence probe.
    pub fn presence(&self) -> OwnerPresence {
        OwnerPresence {
            instance_id: self.presence.instance_id.clone(),
            started_at: self.presence.started_at,
            uptime_ms: u64::try_from(self.presence.started.elapsed().as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Run one request and wrap its outcome into a response.
    pub async fn handle(&self, request: &StorageRequest) -> StorageResponse {
        let outcome = match StorageCommand::from_request(request) {
            Ok(command) => {
                debug!(
                    request_id = request.request_id,
                    kind = request.kind,
                    write = command.is_write(),
                    "Handling storage request"
                );
                self.execute(command).await
            }
            Err(e) => Err(StorageError::from(e)),
        };
        match outcome {
            Ok(data) => StorageResponse::ok(&request.request_id, data),
            Err(e) => {
                warn!(
                    request_id = request.request_id,
                    kind = request.kind,
                    error = %e,
                    "Storage request failed"
                );
                StorageResponse::err(&request.request_id, e.to_string())
            }
        }
    }

    /// Run one command against the engine, returning its JSON result.
    pub async fn execute(&self, command: StorageCommand) -> Result<Value, StorageError> {
        let engine = self.engine.as_ref();
        let data = match command {
            StorageCommand::GetOrganism { id } => {
                serde_json::to_value(engine.get_organism(id).await?)?
            }
            StorageCommand::SaveOrganism(organism) => {
                engine.save_organism(&organism).await?;
                Value::Null
            }
            StorageCommand::GetBehavior { url } => {
                serde_json::to_value(engine.get_behavior(&url).await?)?
            }
            StorageCommand::SaveBehavior(behavior) => {
                engine.save_behavior(&behavior).await?;
                Value::Null
            }
            StorageCommand::AddMutation(mutation) => {
                engine.add_mutation(&mutation).await?;
                Value::Null
            }
            StorageCommand::GetRecentMutations { limit } => {
                serde_json::to_value(engine.get_recent_mutations(limit).await?)?
            }
            StorageCommand::GetSetting { key, default_value } => {
                engine.get_setting(&key, default_value).await?
            }
            StorageCommand::SetSetting { key, value } => {
                engine.set_setting(&key, &value).await?;
                Value::Null
            }
            StorageCommand::AddInvitation(invitation) => {
                engine.add_invitation(&invitation).await?;
                Value::Null
            }
            StorageCommand::UpdateInvitation { code, update } => {
                serde_json::to_value(engine.update_invitation(&code, &update).await?)?
            }
            StorageCommand::GetInvitation { code } => {
                serde_json::to_value(engine.get_invitation(&code).await?)?
            }
            StorageCommand::GetAllInvitations => {
                serde_json::to_value(engine.get_all_invitations().await?)?
            }
            StorageCommand::GetBehaviorPatterns => {
                serde_json::to_value(engine.get_behavior_patterns().await?)?
            }
            StorageCommand::GetRecentActivity { period_ms } => serde_json::to_value(
                engine
                    .get_recent_activity(Duration::from_millis(period_ms))
                    .await?,
            )?,
            StorageCommand::Cleanup { retention_days } => {
                serde_json::to_value(engine.cleanup(retention_days).await?)?
            }
            StorageCommand::GetStorageStats => {
                serde_json::to_value(engine.get_storage_stats().await?)?
            }
            StorageCommand::Ping => serde_json::to_value(self.presence())?,
        };
        Ok(data)
    }
}

impl MessageHandler for OwnerHandler {
    fn on_message(&self, message: &Value, reply: Reply) -> bool {
        let Some(kind) = message.get("type").and_then(Value::as_str) else {
            return false;
        };
        if !StorageRequest::is_storage_kind(kind) {
            return false;
        }

        // A request id that is not a string cannot be matched by the sender,
        // so such messages stay unclaimed.
        let request = match serde_json::from_value::<StorageRequest>(message.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(kind, error = %e, "Dropping malformed storage envelope");
                return false;
            }
        };

        let handler = self.clone();
        tokio::spawn(async move {
            let response = handler.handle(&request).await;
            reply.send(response);
        });
        true
    }
}
