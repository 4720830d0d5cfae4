//! The storage engine contract.
//!
//! [`StorageEngine`] is the record store the owner context holds exclusively.
//! The coordinator depends only on this trait, so tests and alternative
//! backends can stand in for [`crate::SledEngine`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use symbiont_types::{
    BehaviorPattern, BehaviorRecord, CleanupReport, Invitation, InvitationUpdate, Mutation,
    Organism, OrganismId, RecentActivity, StorageStats,
};

use crate::error::StoreError;

/// Asynchronous CRUD surface over the persisted records.
///
/// Implementations must tolerate concurrent calls from many request
/// handlers; they serialize internally as far as their backend requires.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Read an organism by id, or the most recently updated one when `id` is `None`.
    async fn get_organism(&self, id: Option<OrganismId>) -> Result<Option<Organism>, StoreError>;

    /// Insert or replace an organism.
    async fn save_organism(&self, organism: &Organism) -> Result<(), StoreError>;

    /// Read the behavior record of `url`.
    async fn get_behavior(&self, url: &str) -> Result<Option<BehaviorRecord>, StoreError>;

    /// Insert or replace a behavior record.
    async fn save_behavior(&self, behavior: &BehaviorRecord) -> Result<(), StoreError>;

    /// Append an entry to the mutation log.
    async fn add_mutation(&self, mutation: &Mutation) -> Result<(), StoreError>;

    /// Read up to `limit` mutation log entries, newest first.
    async fn get_recent_mutations(&self, limit: usize) -> Result<Vec<Mutation>, StoreError>;

    /// Read a setting, falling back to `default_value` when it is absent.
    async fn get_setting(&self, key: &str, default_value: Value) -> Result<Value, StoreError>;

    /// Write a setting.
    async fn set_setting(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Store a new invitation; fails with [`StoreError::Duplicate`] if the code exists.
    async fn add_invitation(&self, invitation: &Invitation) -> Result<(), StoreError>;

    /// Patch an existing invitation and return its new state.
    async fn update_invitation(
        &self,
        code: &str,
        update: &InvitationUpdate,
    ) -> Result<Invitation, StoreError>;

    /// Read an invitation by code.
    async fn get_invitation(&self, code: &str) -> Result<Option<Invitation>, StoreError>;

    /// Read every invitation, oldest first.
    async fn get_all_invitations(&self) -> Result<Vec<Invitation>, StoreError>;

    /// Aggregate behavior records per domain, most visited first.
    async fn get_behavior_patterns(&self) -> Result<Vec<BehaviorPattern>, StoreError>;

    /// Behavior and mutations recorded within the trailing `period`.
    async fn get_recent_activity(&self, period: Duration) -> Result<RecentActivity, StoreError>;

    /// Remove records older than `retention_days` and expire stale invitations.
    async fn cleanup(&self, retention_days: u32) -> Result<CleanupReport, StoreError>;

    /// Record counts and on-disk size.
    async fn get_storage_stats(&self) -> Result<StorageStats, StoreError>;

    /// Flush outstanding data and refuse further operations.
    async fn close(&self) -> Result<(), StoreError>;
}
