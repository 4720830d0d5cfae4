//! Shared type definitions for the Symbiont storage layer.
//!
//! This crate is the single source of truth for the records kept by the
//! embedded store and for the envelopes exchanged between execution
//! contexts. Types flow downstream to `TypeScript` via `ts-rs` so the
//! extension's popup and content scripts speak the same wire format.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for organisms and mutations
//! - [`records`] -- Stored records and query results
//! - [`envelope`] -- Request/response envelopes crossing the message channel
//! - [`command`] -- Typed storage operations carried inside envelopes

pub mod command;
pub mod envelope;
pub mod ids;
pub mod records;

// Re-export all public types at crate root for convenience.
pub use command::{CommandError, StorageCommand, kinds};
pub use envelope::{STORAGE_PREFIX, StorageRequest, StorageResponse};
pub use ids::{MutationId, OrganismId};
pub use records::{
    BehaviorPattern, BehaviorRecord, CleanupReport, Invitation, InvitationStatus,
    InvitationUpdate, Mutation, Organism, OwnerPresence, RecentActivity, StorageStats, domain_of,
};
