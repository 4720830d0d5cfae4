//! The storage coordinator and its per-process factory.
//!
//! [`StorageCoordinator`] offers the same CRUD surface in every context. In
//! the owner context it calls the storage engine directly and serves other
//! contexts over the channel; in a proxy context it forwards each call to the
//! owner. Callers never need to know which side they are on.
//!
//! [`CoordinatorFactory`] resolves the role once and builds the coordinator
//! lazily on first use. It replaces a process-wide singleton: tests create
//! as many factories as they need and [`CoordinatorFactory::reset`] them.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use symbiont_store::{SledEngine, StorageEngine, StoreConfig};
use symbiont_types::{
    BehaviorPattern, BehaviorRecord, CleanupReport, Invitation, InvitationUpdate, Mutation,
    Organism, OrganismId, OwnerPresence, RecentActivity, StorageCommand, StorageStats,
};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Registration};
use crate::config::SyncConfig;
use crate::error::StorageError;
use crate::owner::OwnerHandler;
use crate::proxy::ProxyClient;
use crate::role::{ContextSignals, Role};

enum Backend {
    Owner {
        engine: Arc<dyn StorageEngine>,
        handler: OwnerHandler,
        registration: Mutex<Option<Registration>>,
    },
    Proxy(ProxyClient),
}

/// Uniform access to the shared database from any context.
pub struct StorageCoordinator {
    backend: Backend,
}

impl std::fmt::Debug for StorageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCoordinator")
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

impl StorageCoordinator {
    /// Become the owner: open the embedded database at `config` and answer
    /// requests arriving on `channel`.
    ///
    /// The engine is opened before the listener is attached, so no request
    /// is ever seen by an owner without a database.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Engine`] if the database cannot be opened, or
    /// [`StorageError::Channel`] if the listener cannot be attached.
    pub async fn open_owner(
        config: &StoreConfig,
        channel: &dyn Channel,
    ) -> Result<Self, StorageError> {
        let engine = SledEngine::open(config)?;
        Self::owner(Arc::new(engine), channel).await
    }

    /// Become the owner of an already opened `engine`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Channel`] if the listener cannot be attached.
    pub async fn owner(
        engine: Arc<dyn StorageEngine>,
        channel: &dyn Channel,
    ) -> Result<Self, StorageError> {
        let handler = OwnerHandler::new(Arc::clone(&engine));
        let registration = channel.register_owner(Arc::new(handler.clone())).await?;
        info!(instance_id = handler.instance_id(), "Storage owner ready");
        Ok(Self {
            backend: Backend::Owner {
                engine,
                handler,
                registration: Mutex::new(Some(registration)),
            },
        })
    }

    /// Become a proxy forwarding every call over `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Channel`] if the connection cannot be opened.
    pub async fn proxy(channel: &dyn Channel, timeout: Duration) -> Result<Self, StorageError> {
        let endpoint = channel.connect_proxy().await?;
        debug!(
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Storage proxy connected"
        );
        Ok(Self {
            backend: Backend::Proxy(ProxyClient::new(endpoint, timeout)),
        })
    }

    /// The role this coordinator plays.
    pub const fn role(&self) -> Role {
        match self.backend {
            Backend::Owner { .. } => Role::Owner,
            Backend::Proxy(_) => Role::Proxy,
        }
    }

    /// Number of proxied requests awaiting a response; always zero for the owner.
    pub fn pending_requests(&self) -> usize {
        match &self.backend {
            Backend::Owner { .. } => 0,
            Backend::Proxy(proxy) => proxy.pending_count(),
        }
    }

    // =========================================================================
    // Organisms
    // =========================================================================

    /// Read an organism by id, or the most recently updated one.
    pub async fn get_organism(
        &self,
        id: Option<OrganismId>,
    ) -> Result<Option<Organism>, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.get_organism(id).await?),
            Backend::Proxy(proxy) => proxy.call(StorageCommand::GetOrganism { id }).await,
        }
    }

    /// Insert or replace an organism.
    pub async fn save_organism(&self, organism: &Organism) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.save_organism(organism).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .call(StorageCommand::SaveOrganism(Box::new(organism.clone())))
                    .await
            }
        }
    }

    // =========================================================================
    // Behavior
    // =========================================================================

    /// Read the behavior record of `url`.
    pub async fn get_behavior(&self, url: &str) -> Result<Option<BehaviorRecord>, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.get_behavior(url).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .call(StorageCommand::GetBehavior {
                        url: url.to_owned(),
                    })
                    .await
            }
        }
    }

    /// Insert or replace a behavior record.
    pub async fn save_behavior(&self, behavior: &BehaviorRecord) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.save_behavior(behavior).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .call(StorageCommand::SaveBehavior(Box::new(behavior.clone())))
                    .await
            }
        }
    }

    /// Aggregate behavior per domain, most visited first.
    pub async fn get_behavior_patterns(&self) -> Result<Vec<BehaviorPattern>, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.get_behavior_patterns().await?),
            Backend::Proxy(proxy) => proxy.call(StorageCommand::GetBehaviorPatterns).await,
        }
    }

    /// Behavior and mutations recorded within the trailing `period`.
    pub async fn get_recent_activity(
        &self,
        period: Duration,
    ) -> Result<RecentActivity, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.get_recent_activity(period).await?),
            Backend::Proxy(proxy) => {
                let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
                proxy
                    .call(StorageCommand::GetRecentActivity { period_ms })
                    .await
            }
        }
    }

    // =========================================================================
    // Mutation log
    // =========================================================================

    /// Append an entry to the mutation log.
    pub async fn add_mutation(&self, mutation: &Mutation) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.add_mutation(mutation).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .call(StorageCommand::AddMutation(Box::new(mutation.clone())))
                    .await
            }
        }
    }

    /// Read up to `limit` mutation log entries, newest first.
    pub async fn get_recent_mutations(&self, limit: usize) -> Result<Vec<Mutation>, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.get_recent_mutations(limit).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .call(StorageCommand::GetRecentMutations { limit })
                    .await
            }
        }
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Read a setting, falling back to `default_value` when it is absent.
    pub async fn get_setting(
        &self,
        key: &str,
        default_value: Value,
    ) -> Result<Value, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.get_setting(key, default_value).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .send(StorageCommand::GetSetting {
                        key: key.to_owned(),
                        default_value,
                    })
                    .await
            }
        }
    }

    /// Write a setting.
    pub async fn set_setting(&self, key: &str, value: Value) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.set_setting(key, &value).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .call(StorageCommand::SetSetting {
                        key: key.to_owned(),
                        value,
                    })
                    .await
            }
        }
    }

    // =========================================================================
    // Invitations
    // =========================================================================

    /// Store a new invitation.
    pub async fn add_invitation(&self, invitation: &Invitation) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.add_invitation(invitation).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .call(StorageCommand::AddInvitation(Box::new(invitation.clone())))
                    .await
            }
        }
    }

    /// Patch an existing invitation and return its new state.
    pub async fn update_invitation(
        &self,
        code: &str,
        update: InvitationUpdate,
    ) -> Result<Invitation, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.update_invitation(code, &update).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .call(StorageCommand::UpdateInvitation {
                        code: code.to_owned(),
                        update,
                    })
                    .await
            }
        }
    }

    /// Read an invitation by code.
    pub async fn get_invitation(&self, code: &str) -> Result<Option<Invitation>, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.get_invitation(code).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .call(StorageCommand::GetInvitation {
                        code: code.to_owned(),
                    })
                    .await
            }
        }
    }

    /// Read every invitation, oldest first.
    pub async fn get_all_invitations(&self) -> Result<Vec<Invitation>, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.get_all_invitations().await?),
            Backend::Proxy(proxy) => proxy.call(StorageCommand::GetAllInvitations).await,
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Remove records older than `retention_days` and expire stale invitations.
    pub async fn cleanup(&self, retention_days: u32) -> Result<CleanupReport, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.cleanup(retention_days).await?),
            Backend::Proxy(proxy) => {
                proxy
                    .call(StorageCommand::Cleanup { retention_days })
                    .await
            }
        }
    }

    /// Record counts and on-disk size.
    pub async fn get_storage_stats(&self) -> Result<StorageStats, StorageError> {
        match &self.backend {
            Backend::Owner { engine, .. } => Ok(engine.get_storage_stats().await?),
            Backend::Proxy(proxy) => proxy.call(StorageCommand::GetStorageStats).await,
        }
    }

    /// Identify the owner serving this coordinator.
    pub async fn ping(&self) -> Result<OwnerPresence, StorageError> {
        match &self.backend {
            Backend::Owner { handler, .. } => Ok(handler.presence()),
            Backend::Proxy(proxy) => proxy.call(StorageCommand::Ping).await,
        }
    }

    /// Release the coordinator.
    ///
    /// The owner stops answering requests, then flushes and closes the
    /// engine. A proxy stops routing responses. Either way further calls
    /// fail with [`StorageError::Closed`]. Closing twice is harmless.
    pub async fn close(&self) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Owner {
                engine,
                registration,
                ..
            } => {
                let registration = registration
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(registration) = registration {
                    registration.unregister();
                }
                engine.close().await?;
            }
            Backend::Proxy(proxy) => proxy.close(),
        }
        info!(role = %self.role(), "Storage coordinator closed");
        Ok(())
    }
}

/// Lazily builds the one coordinator of a process.
pub struct CoordinatorFactory {
    config: SyncConfig,
    signals: ContextSignals,
    channel: Arc<dyn Channel>,
    instance: OnceCell<Arc<StorageCoordinator>>,
}

impl std::fmt::Debug for CoordinatorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorFactory")
            .field("context", &self.config.context)
            .field("signals", &self.signals)
            .field("initialized", &self.instance.initialized())
            .finish_non_exhaustive()
    }
}

impl CoordinatorFactory {
    /// A factory for the context described by `config`, talking over `channel`.
    pub fn new(config: SyncConfig, channel: Arc<dyn Channel>) -> Self {
        let signals = config.context.signals();
        Self {
            config,
            signals,
            channel,
            instance: OnceCell::new(),
        }
    }

    /// Override the environment signals used for role resolution.
    ///
    /// Only affects coordinators built afterwards; an existing coordinator
    /// keeps the role it was built with until [`CoordinatorFactory::reset`].
    #[must_use]
    pub const fn with_signals(mut self, signals: ContextSignals) -> Self {
        self.signals = signals;
        self
    }

    /// The role this factory's coordinator plays.
    ///
    /// Once a coordinator exists this is its role, whatever the signals say.
    pub fn role(&self) -> Role {
        self.instance.get().map_or_else(
            || Role::resolve(self.signals),
            |coordinator| coordinator.role(),
        )
    }

    /// The coordinator, built on first call.
    ///
    /// Concurrent first calls share one construction; the engine is never
    /// opened twice.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OwnerConflict`] if this context resolves to
    /// owner while another owner already answers on the channel, or any
    /// error from opening the engine or the channel. A failed build is not
    /// cached; the next call tries again.
    pub async fn get_instance(&self) -> Result<Arc<StorageCoordinator>, StorageError> {
        self.instance
            .get_or_try_init(|| self.build())
            .await
            .map(Arc::clone)
    }

    /// Close and forget the current coordinator, if any.
    ///
    /// # Errors
    ///
    /// Returns the error from closing the previous coordinator; it is
    /// forgotten either way.
    pub async fn reset(&mut self) -> Result<(), StorageError> {
        match self.instance.take() {
            Some(coordinator) => coordinator.close().await,
            None => Ok(()),
        }
    }

    async fn build(&self) -> Result<Arc<StorageCoordinator>, StorageError> {
        let role = Role::resolve(self.signals);
        info!(%role, context = %self.config.context, "Resolved storage role");

        let coordinator = match role {
            Role::Owner => {
                self.ensure_no_owner().await?;
                StorageCoordinator::open_owner(&self.config.storage, self.channel.as_ref()).await?
            }
            Role::Proxy => {
                let coordinator = StorageCoordinator::proxy(
                    self.channel.as_ref(),
                    self.config.channel.request_timeout(),
                )
                .await?;
                self.announce_owner().await;
                coordinator
            }
        };
        Ok(Arc::new(coordinator))
    }

    /// Probe the channel for an owner within the probe timeout.
    async fn probe_owner(&self) -> Option<Result<OwnerPresence, StorageError>> {
        let probe_timeout = self.config.channel.owner_probe_timeout()?;
        let endpoint = match self.channel.connect_proxy().await {
            Ok(endpoint) => endpoint,
            Err(e) => return Some(Err(e)),
        };
        let probe = ProxyClient::new(endpoint, probe_timeout);
        Some(probe.call(StorageCommand::Ping).await)
    }

    async fn ensure_no_owner(&self) -> Result<(), StorageError> {
        match self.probe_owner().await {
            Some(Ok(presence)) => {
                warn!(
                    instance_id = presence.instance_id,
                    "Another owner already serves the database"
                );
                Err(StorageError::OwnerConflict {
                    instance_id: presence.instance_id,
                })
            }
            Some(Err(e)) => {
                debug!(error = %e, "No existing owner answered the probe");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn announce_owner(&self) {
        match self.probe_owner().await {
            Some(Ok(presence)) => info!(
                instance_id = presence.instance_id,
                uptime_ms = presence.uptime_ms,
                "Found storage owner"
            ),
            Some(Err(e)) => warn!(
                error = %e,
                "No storage owner answered yet; requests will wait for one"
            ),
            None => {}
        }
    }
}
