//! Cross-context storage coordination for Symbiont.
//!
//! Exactly one execution context (the background worker) owns the embedded
//! store. Every other context reaches it through a message channel: it
//! posts a typed request carrying a unique `requestId` and awaits the
//! response with the same id, giving up after a timeout. Callers use the
//! same [`StorageCoordinator`] API in either role.
//!
//! High-frequency state (organism ticks, page interactions) goes through a
//! [`WriteDebouncer`], which coalesces writes per record and bounds how
//! stale a queued write may become.
//!
//! # Modules
//!
//! - [`role`] -- Owner/proxy role resolution from context signals
//! - [`channel`] -- The message channel seam, in-process and NATS-backed
//! - [`owner`] -- Owner-side request handling
//! - [`proxy`] -- Proxy-side request correlation and timeouts
//! - [`coordinator`] -- [`StorageCoordinator`] and its per-process factory
//! - [`debounce`] -- Generic per-key write debouncing
//! - [`writer`] -- [`WriteDebouncer`] for organisms and behavior records
//! - [`config`] -- YAML configuration with environment overrides
//! - [`error`] -- Shared error types

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod owner;
pub mod proxy;
pub mod role;
pub mod writer;

// Re-export primary types for convenience.
pub use channel::{Channel, MemoryChannel, MessageHandler, NatsChannel, Registration, Reply};
pub use config::{ChannelConfig, ConfigError, DebounceConfig, LoggingConfig, SyncConfig};
pub use coordinator::{CoordinatorFactory, StorageCoordinator};
pub use debounce::{Debouncer, WriteTicket};
pub use error::StorageError;
pub use owner::OwnerHandler;
pub use proxy::ProxyClient;
pub use role::{ContextKind, ContextSignals, Role};
pub use writer::{PendingCount, WriteDebouncer};
