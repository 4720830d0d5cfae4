//! Records persisted by the embedded storage engine.
//!
//! Only the shape needed by the coordination layer is fixed here: the
//! identity used for write coalescing (`Organism::id`, `BehaviorRecord::url`)
//! and the timestamps used by retention and activity queries. Everything
//! else is plain data owned by the extension front-end.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use url::Url;

use crate::ids::{MutationId, OrganismId};

// ---------------------------------------------------------------------------
// Organism
// ---------------------------------------------------------------------------

/// The digital organism grown from browsing behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct Organism {
    /// Stable identity of the organism.
    pub id: OrganismId,
    /// Display name chosen by the user.
    pub name: String,
    /// How many evolutionary generations the organism has gone through.
    pub generation: u32,
    /// Current energy level.
    pub energy: u32,
    /// Named trait values (curiosity, focus, ...), each in `0.0..=1.0`.
    #[serde(default)]
    pub traits: BTreeMap<String, f64>,
    /// When the organism was created.
    pub created_at: DateTime<Utc>,
    /// When the organism was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Organism {
    /// Create a fresh generation-zero organism.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: OrganismId::new(),
            name: name.into(),
            generation: 0,
            energy: 100,
            traits: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

/// Aggregated browsing behavior for a single URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct BehaviorRecord {
    /// The page URL; the record's identity.
    pub url: String,
    /// Host part of the URL, used to group patterns.
    pub domain: String,
    /// Number of visits recorded.
    pub visits: u64,
    /// Total foreground time spent on the page.
    pub total_time_ms: u64,
    /// Timestamp of the latest visit.
    pub last_visit: DateTime<Utc>,
    /// Optional content category assigned by the classifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl BehaviorRecord {
    /// Create a record for the first visit to `url`.
    pub fn first_visit(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            domain: domain_of(&url),
            url,
            visits: 1,
            total_time_ms: 0,
            last_visit: Utc::now(),
            category: None,
        }
    }

    /// Fold another visit of `dwell_ms` into the record.
    pub fn record_visit(&mut self, dwell_ms: u64) {
        self.visits = self.visits.saturating_add(1);
        self.total_time_ms = self.total_time_ms.saturating_add(dwell_ms);
        self.last_visit = Utc::now();
    }
}

/// Host part of `url`, lowercased by the URL parser.
///
/// `https://news.example.com/a/b?c` yields `news.example.com`. Input that does
/// not parse as an absolute URL, or has no host, is returned unchanged.
pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_owned))
        .unwrap_or_else(|| url.to_owned())
}

/// Behavior aggregated per domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct BehaviorPattern {
    /// The domain this pattern summarizes.
    pub domain: String,
    /// Total visits across all URLs of the domain.
    pub visits: u64,
    /// Total foreground time across all URLs of the domain.
    pub total_time_ms: u64,
    /// Most recent visit to any URL of the domain.
    pub last_visit: DateTime<Utc>,
    /// Number of distinct URLs seen for the domain.
    pub urls: u64,
}

// ---------------------------------------------------------------------------
// Mutation log
// ---------------------------------------------------------------------------

/// An append-only entry describing a change to an organism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Unique identity of the log entry.
    pub id: MutationId,
    /// The organism that mutated.
    pub organism_id: OrganismId,
    /// Machine-readable mutation kind (`trait_shift`, `evolution`, ...).
    pub kind: String,
    /// Human-readable description shown in the timeline.
    pub description: String,
    /// Free-form payload attached by the gamification logic.
    #[serde(default)]
    pub data: Value,
    /// When the mutation happened.
    pub timestamp: DateTime<Utc>,
}

impl Mutation {
    /// Create a mutation stamped with the current time.
    pub fn new(
        organism_id: OrganismId,
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: MutationId::new(),
            organism_id,
            kind: kind.into(),
            description: description.into(),
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Invitations
// ---------------------------------------------------------------------------

/// Lifecycle state of an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    /// Waiting for the invitee.
    Pending,
    /// The invitee joined.
    Accepted,
    /// The invitee refused.
    Declined,
    /// The invitation passed its expiry without an answer.
    Expired,
}

/// An invitation for another user to bond with an organism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    /// Shareable invitation code; the record's identity.
    pub code: String,
    /// The organism extending the invitation.
    pub inviter_id: OrganismId,
    /// When the invitation was created.
    pub created_at: DateTime<Utc>,
    /// When the invitation stops being valid.
    pub expires_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: InvitationStatus,
    /// Who accepted the invitation, if anyone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_by: Option<String>,
    /// When the invitation was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
}

impl Invitation {
    /// Create a pending invitation valid until `expires_at`.
    pub fn new(code: impl Into<String>, inviter_id: OrganismId, expires_at: DateTime<Utc>) -> Self {
        Self {
            code: code.into(),
            inviter_id,
            created_at: Utc::now(),
            expires_at,
            status: InvitationStatus::Pending,
            accepted_by: None,
            accepted_at: None,
        }
    }

    /// Whether the invitation is still pending past its expiry at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == InvitationStatus::Pending && self.expires_at < now
    }
}

/// Partial update applied by `update_invitation`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct InvitationUpdate {
    /// New lifecycle state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InvitationStatus>,
    /// Who accepted the invitation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_by: Option<String>,
    /// When the invitation was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
}

impl InvitationUpdate {
    /// Apply the set fields onto `invitation`, leaving the rest untouched.
    pub fn apply(&self, invitation: &mut Invitation) {
        if let Some(status) = self.status {
            invitation.status = status;
        }
        if let Some(accepted_by) = &self.accepted_by {
            invitation.accepted_by = Some(accepted_by.clone());
        }
        if let Some(accepted_at) = self.accepted_at {
            invitation.accepted_at = Some(accepted_at);
        }
    }
}

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// Behavior and mutations recorded within a trailing time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct RecentActivity {
    /// Length of the window in milliseconds.
    pub period_ms: u64,
    /// Start of the window.
    pub since: DateTime<Utc>,
    /// Behavior records visited inside the window, newest first.
    pub behaviors: Vec<BehaviorRecord>,
    /// Mutations inside the window, newest first.
    pub mutations: Vec<Mutation>,
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Behavior records older than the retention period that were deleted.
    pub behaviors_removed: u64,
    /// Mutations older than the retention period that were deleted.
    pub mutations_removed: u64,
    /// Pending invitations past their expiry that were marked expired.
    pub invitations_expired: u64,
}

/// Record counts and on-disk size of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    /// Number of organisms stored.
    pub organisms: u64,
    /// Number of behavior records stored.
    pub behaviors: u64,
    /// Number of mutation log entries stored.
    pub mutations: u64,
    /// Number of settings stored.
    pub settings: u64,
    /// Number of invitations stored.
    pub invitations: u64,
    /// Approximate size of the database on disk.
    pub size_on_disk_bytes: u64,
}

/// Presence information returned by the owner context to a ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct OwnerPresence {
    /// Random identity of the owner process, fixed for its lifetime.
    pub instance_id: String,
    /// When the owner opened the storage engine.
    pub started_at: DateTime<Utc>,
    /// Milliseconds since the owner opened the storage engine.
    pub uptime_ms: u64,
}
