//! `sled`-backed implementation of [`StorageEngine`].
//!
//! Each record family lives in its own tree. Values are JSON so the on-disk
//! bytes match what the extension front-end sends over the channel.
//!
//! # Trees
//!
//! | Tree | Key | Value |
//! |------|-----|-------|
//! | `organisms` | organism id (hyphenated UUID) | [`Organism`] |
//! | `behaviors` | page URL | [`BehaviorRecord`] |
//! | `mutations` | timestamp millis (BE u64) ++ mutation id bytes | [`Mutation`] |
//! | `settings` | setting name | arbitrary JSON |
//! | `invitations` | invitation code | [`Invitation`] |
//!
//! Mutation keys sort by time, so "most recent" and "older than" queries are
//! plain range scans.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sled::{Db, Tree};
use symbiont_types::{
    BehaviorPattern, BehaviorRecord, CleanupReport, Invitation, InvitationStatus,
    InvitationUpdate, Mutation, Organism, OrganismId, RecentActivity, StorageStats,
};
use tracing::{debug, info};

use crate::engine::StorageEngine;
use crate::error::StoreError;

const ORGANISMS: &str = "organisms";
const BEHAVIORS: &str = "behaviors";
const MUTATIONS: &str = "mutations";
const SETTINGS: &str = "settings";
const INVITATIONS: &str = "invitations";

/// Where and how the embedded database is opened.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the database files.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Open a throwaway database that is deleted on drop (tests, demos).
    #[serde(default)]
    pub temporary: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            temporary: false,
        }
    }
}

impl StoreConfig {
    /// A temporary database, removed when the engine is dropped.
    pub fn temporary() -> Self {
        Self {
            path: default_path(),
            temporary: true,
        }
    }
}

fn default_path() -> PathBuf {
    PathBuf::from("symbiont.db")
}

/// Storage engine persisting records in a `sled` database.
pub struct SledEngine {
    db: Db,
    organisms: Tree,
    behaviors: Tree,
    mutations: Tree,
    settings: Tree,
    invitations: Tree,
    closed: AtomicBool,
}

impl std::fmt::Debug for SledEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledEngine")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SledEngine {
    /// Open (or create) the database described by `config`.
    ///
    /// `sled` takes an exclusive file lock on the directory, so a second
    /// process trying to open the same path fails here instead of
    /// corrupting the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the parent directory cannot be created.
    /// Returns [`StoreError::Sled`] if the database cannot be opened.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let db = if config.temporary {
            sled::Config::new().temporary(true).open()?
        } else {
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            sled::Config::new().path(&config.path).open()?
        };

        let engine = Self {
            organisms: db.open_tree(ORGANISMS)?,
            behaviors: db.open_tree(BEHAVIORS)?,
            mutations: db.open_tree(MUTATIONS)?,
            settings: db.open_tree(SETTINGS)?,
            invitations: db.open_tree(INVITATIONS)?,
            db,
            closed: AtomicBool::new(false),
        };

        info!(
            path = %config.path.display(),
            temporary = config.temporary,
            "Storage engine opened"
        );
        Ok(engine)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Sync the database to disk on sled's flusher pool, off the executor.
    async fn persist(&self) -> Result<(), StoreError> {
        let _bytes = self.db.flush_async().await?;
        Ok(())
    }
}

// =============================================================================
// Key and value helpers
// =============================================================================

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn read<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<T>, StoreError> {
    tree.get(key)?.map(|bytes| decode(&bytes)).transpose()
}

fn read_all<T: DeserializeOwned>(tree: &Tree) -> Result<Vec<T>, StoreError> {
    let mut values = Vec::with_capacity(tree.len());
    for entry in tree.iter() {
        let (_, bytes) = entry?;
        values.push(decode(&bytes)?);
    }
    Ok(values)
}

/// Big-endian millisecond prefix used for time-ordered mutation keys.
///
/// Timestamps before the Unix epoch clamp to zero.
fn millis_prefix(at: DateTime<Utc>) -> [u8; 8] {
    u64::try_from(at.timestamp_millis())
        .unwrap_or(0)
        .to_be_bytes()
}

fn mutation_key(mutation: &Mutation) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&millis_prefix(mutation.timestamp));
    key.extend_from_slice(mutation.id.into_inner().as_bytes());
    key
}

fn tree_len(tree: &Tree) -> u64 {
    u64::try_from(tree.len()).unwrap_or(u64::MAX)
}

/// `now - period`, saturating at the earliest representable instant.
fn window_start(now: DateTime<Utc>, period: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(period)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl StorageEngine for SledEngine {
    async fn get_organism(&self, id: Option<OrganismId>) -> Result<Option<Organism>, StoreError> {
        self.ensure_open()?;
        match id {
            Some(id) => read(&self.organisms, id.to_string().as_bytes()),
            None => {
                let organisms: Vec<Organism> = read_all(&self.organisms)?;
                Ok(organisms.into_iter().max_by_key(|o| o.updated_at))
            }
        }
    }

    async fn save_organism(&self, organism: &Organism) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.organisms
            .insert(organism.id.to_string().as_bytes(), encode(organism)?)?;
        self.persist().await?;
        debug!(organism_id = %organism.id, "Saved organism");
        Ok(())
    }

    async fn get_behavior(&self, url: &str) -> Result<Option<BehaviorRecord>, StoreError> {
        self.ensure_open()?;
        read(&self.behaviors, url.as_bytes())
    }

    async fn save_behavior(&self, behavior: &BehaviorRecord) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.behaviors
            .insert(behavior.url.as_bytes(), encode(behavior)?)?;
        self.persist().await?;
        debug!(url = behavior.url, "Saved behavior");
        Ok(())
    }

    async fn add_mutation(&self, mutation: &Mutation) -> Result<(), StoreError> {
        self.ensure_open()?;
        let key = mutation_key(mutation);
        let swapped = self
            .mutations
            .compare_and_swap(&key, None::<&[u8]>, Some(encode(mutation)?))?;
        if swapped.is_err() {
            return Err(StoreError::Duplicate {
                tree: MUTATIONS,
                key: mutation.id.to_string(),
            });
        }
        self.persist().await?;
        debug!(mutation_id = %mutation.id, kind = mutation.kind, "Appended mutation");
        Ok(())
    }

    async fn get_recent_mutations(&self, limit: usize) -> Result<Vec<Mutation>, StoreError> {
        self.ensure_open()?;
        let mut mutations = Vec::with_capacity(limit.min(self.mutations.len()));
        for entry in self.mutations.iter().rev().take(limit) {
            let (_, bytes) = entry?;
            mutations.push(decode(&bytes)?);
        }
        Ok(mutations)
    }

    async fn get_setting(&self, key: &str, default_value: Value) -> Result<Value, StoreError> {
        self.ensure_open()?;
        Ok(read(&self.settings, key.as_bytes())?.unwrap_or(default_value))
    }

    async fn set_setting(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.settings.insert(key.as_bytes(), encode(value)?)?;
        self.persist().await
    }

    async fn add_invitation(&self, invitation: &Invitation) -> Result<(), StoreError> {
        self.ensure_open()?;
        let swapped = self.invitations.compare_and_swap(
            invitation.code.as_bytes(),
            None::<&[u8]>,
            Some(encode(invitation)?),
        )?;
        if swapped.is_err() {
            return Err(StoreError::Duplicate {
                tree: INVITATIONS,
                key: invitation.code.clone(),
            });
        }
        self.persist().await
    }

    async fn update_invitation(
        &self,
        code: &str,
        update: &InvitationUpdate,
    ) -> Result<Invitation, StoreError> {
        self.ensure_open()?;
        // Read-modify-write with compare-and-swap so two handlers patching the
        // same invitation concurrently never lose one of the patches.
        loop {
            let Some(current) = self.invitations.get(code.as_bytes())? else {
                return Err(StoreError::NotFound {
                    tree: INVITATIONS,
                    key: code.to_owned(),
                });
            };
            let mut invitation: Invitation = decode(&current)?;
            update.apply(&mut invitation);
            let swapped = self.invitations.compare_and_swap(
                code.as_bytes(),
                Some(&current),
                Some(encode(&invitation)?),
            )?;
            if swapped.is_ok() {
                self.persist().await?;
                return Ok(invitation);
            }
        }
    }

    async fn get_invitation(&self, code: &str) -> Result<Option<Invitation>, StoreError> {
        self.ensure_open()?;
        read(&self.invitations, code.as_bytes())
    }

    async fn get_all_invitations(&self) -> Result<Vec<Invitation>, StoreError> {
        self.ensure_open()?;
        let mut invitations: Vec<Invitation> = read_all(&self.invitations)?;
        invitations.sort_by_key(|i| i.created_at);
        Ok(invitations)
    }

    async fn get_behavior_patterns(&self) -> Result<Vec<BehaviorPattern>, StoreError> {
        self.ensure_open()?;
        let behaviors: Vec<BehaviorRecord> = read_all(&self.behaviors)?;

        let mut by_domain: BTreeMap<String, BehaviorPattern> = BTreeMap::new();
        for behavior in behaviors {
            let pattern = by_domain
                .entry(behavior.domain.clone())
                .or_insert_with(|| BehaviorPattern {
                    domain: behavior.domain.clone(),
                    visits: 0,
                    total_time_ms: 0,
                    last_visit: behavior.last_visit,
                    urls: 0,
                });
            pattern.visits = pattern.visits.saturating_add(behavior.visits);
            pattern.total_time_ms = pattern.total_time_ms.saturating_add(behavior.total_time_ms);
            pattern.last_visit = pattern.last_visit.max(behavior.last_visit);
            pattern.urls = pattern.urls.saturating_add(1);
        }

        let mut patterns: Vec<BehaviorPattern> = by_domain.into_values().collect();
        patterns.sort_by(|a, b| {
            b.visits
                .cmp(&a.visits)
                .then_with(|| b.total_time_ms.cmp(&a.total_time_ms))
        });
        Ok(patterns)
    }

    async fn get_recent_activity(&self, period: Duration) -> Result<RecentActivity, StoreError> {
        self.ensure_open()?;
        let now = Utc::now();
        let since = window_start(now, TimeDelta::from_std(period).unwrap_or(TimeDelta::MAX));

        let mut behaviors: Vec<BehaviorRecord> = read_all::<BehaviorRecord>(&self.behaviors)?
            .into_iter()
            .filter(|b| b.last_visit >= since)
            .collect();
        behaviors.sort_by(|a, b| b.last_visit.cmp(&a.last_visit));

        let mut mutations = Vec::new();
        for entry in self.mutations.range(millis_prefix(since)..).rev() {
            let (_, bytes) = entry?;
            mutations.push(decode::<Mutation>(&bytes)?);
        }

        Ok(RecentActivity {
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            since,
            behaviors,
            mutations,
        })
    }

    async fn cleanup(&self, retention_days: u32) -> Result<CleanupReport, StoreError> {
        self.ensure_open()?;
        let now = Utc::now();
        let retention = TimeDelta::try_days(i64::from(retention_days)).unwrap_or(TimeDelta::MAX);
        let cutoff = window_start(now, retention);
        let mut report = CleanupReport::default();

        for entry in self.behaviors.iter() {
            let (key, bytes) = entry?;
            let behavior: BehaviorRecord = decode(&bytes)?;
            if behavior.last_visit < cutoff {
                self.behaviors.remove(key)?;
                report.behaviors_removed = report.behaviors_removed.saturating_add(1);
            }
        }

        let expired_keys: Vec<sled::IVec> = self
            .mutations
            .range(..millis_prefix(cutoff))
            .keys()
            .collect::<Result<_, _>>()?;
        for key in expired_keys {
            self.mutations.remove(key)?;
            report.mutations_removed = report.mutations_removed.saturating_add(1);
        }

        for entry in self.invitations.iter() {
            let (key, bytes) = entry?;
            let mut invitation: Invitation = decode(&bytes)?;
            if invitation.is_stale(now) {
                invitation.status = InvitationStatus::Expired;
                self.invitations.insert(key, encode(&invitation)?)?;
                report.invitations_expired = report.invitations_expired.saturating_add(1);
            }
        }

        self.persist().await?;
        info!(
            retention_days,
            behaviors_removed = report.behaviors_removed,
            mutations_removed = report.mutations_removed,
            invitations_expired = report.invitations_expired,
            "Retention cleanup finished"
        );
        Ok(report)
    }

    async fn get_storage_stats(&self) -> Result<StorageStats, StoreError> {
        self.ensure_open()?;
        Ok(StorageStats {
            organisms: tree_len(&self.organisms),
            behaviors: tree_len(&self.behaviors),
            mutations: tree_len(&self.mutations),
            settings: tree_len(&self.settings),
            invitations: tree_len(&self.invitations),
            size_on_disk_bytes: self.db.size_on_disk()?,
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.persist().await?;
        info!("Storage engine closed");
        Ok(())
    }
}
