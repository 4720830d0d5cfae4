//! Integration tests for the `sled`-backed storage engine.
//!
//! Every test opens its own database (temporary, or inside a `tempfile`
//! directory when persistence across reopen is under test), so tests run in
//! parallel without sharing state.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing
)]

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::json;
use symbiont_store::{SledEngine, StorageEngine, StoreConfig, StoreError};
use symbiont_types::{
    BehaviorRecord, Invitation, InvitationStatus, InvitationUpdate, Mutation, Organism, OrganismId,
};

fn temporary_engine() -> SledEngine {
    SledEngine::open(&StoreConfig::temporary()).expect("temporary sled database")
}

fn behavior(url: &str, visits: u64, total_time_ms: u64, age: TimeDelta) -> BehaviorRecord {
    let mut record = BehaviorRecord::first_visit(url);
    record.visits = visits;
    record.total_time_ms = total_time_ms;
    record.last_visit = Utc::now() - age;
    record
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        path: dir.path().join("organism.db"),
        temporary: false,
    };

    let organism = Organism::new("Persisted");
    {
        let engine = SledEngine::open(&config).unwrap();
        engine.save_organism(&organism).await.unwrap();
        engine.set_setting("theme", &json!("dark")).await.unwrap();
        engine.close().await.unwrap();
    }

    let engine = SledEngine::open(&config).unwrap();
    let loaded = engine.get_organism(Some(organism.id)).await.unwrap();
    assert_eq!(loaded, Some(organism));
    let theme = engine.get_setting("theme", json!("light")).await.unwrap();
    assert_eq!(theme, json!("dark"));
}

// =============================================================================
// Behavior
// =============================================================================

#[tokio::test]
async fn behavior_is_replaced_by_url() {
    let engine = temporary_engine();
    let mut record = BehaviorRecord::first_visit("https://example.com/a");
    engine.save_behavior(&record).await.unwrap();
    record.record_visit(2_000);
    engine.save_behavior(&record).await.unwrap();

    let loaded = engine
        .get_behavior("https://example.com/a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.visits, 2);
    assert_eq!(engine.get_storage_stats().await.unwrap().behaviors, 1);
    assert!(engine.get_behavior("https://nowhere.test/").await.unwrap().is_none());
}

#[tokio::test]
async fn patterns_group_by_domain_most_visited_first() {
    let engine = temporary_engine();
    let records = [
        behavior("https://news.test/1", 3, 1_000, TimeDelta::minutes(5)),
        behavior("https://news.test/2", 4, 2_000, TimeDelta::minutes(1)),
        behavior("https://video.test/watch", 10, 60_000, TimeDelta::hours(2)),
    ];
    for record in &records {
        engine.save_behavior(record).await.unwrap();
    }

    let patterns = engine.get_behavior_patterns().await.unwrap();
    assert_eq!(patterns.len(), 2);
    assert_eq!(patterns[0].domain, "video.test");
    assert_eq!(patterns[0].visits, 10);
    assert_eq!(patterns[1].domain, "news.test");
    assert_eq!(patterns[1].visits, 7);
    assert_eq!(patterns[1].total_time_ms, 3_000);
    assert_eq!(patterns[1].urls, 2);
    assert_eq!(patterns[1].last_visit, records[1].last_visit);
}

// =============================================================================
// Mutation log
// =============================================================================

#[tokio::test]
async fn recent_mutations_are_newest_first_and_limited() {
    let engine = temporary_engine();
    let organism = OrganismId::new();
    for minutes_ago in [30, 20, 10] {
        let mut mutation = Mutation::new(organism, "trait_shift", format!("{minutes_ago}m ago"));
        mutation.timestamp = Utc::now() - TimeDelta::minutes(minutes_ago);
        engine.add_mutation(&mutation).await.unwrap();
    }

    let recent = engine.get_recent_mutations(2).await.unwrap();
    let descriptions: Vec<&str> = recent.iter().map(|m| m.description.as_str()).collect();
    assert_eq!(descriptions, ["10m ago", "20m ago"]);
}

#[tokio::test]
async fn duplicate_mutation_is_rejected() {
    let engine = temporary_engine();
    let mutation = Mutation::new(OrganismId::new(), "evolution", "grew a fin");
    engine.add_mutation(&mutation).await.unwrap();
    let again = engine.add_mutation(&mutation).await;
    assert!(matches!(again, Err(StoreError::Duplicate { .. })));
}

// =============================================================================
// Settings
// =============================================================================

#[tokio::test]
async fn setting_falls_back_to_default() {
    let engine = temporary_engine();
    let value = engine.get_setting("volume", json!(0.5)).await.unwrap();
    assert_eq!(value, json!(0.5));

    engine.set_setting("volume", &json!(1)).await.unwrap();
    let value = engine.get_setting("volume", json!(0.5)).await.unwrap();
    assert_eq!(value, json!(1));
}

// =============================================================================
// Invitations
// =============================================================================

#[tokio::test]
async fn invitation_lifecycle() {
    let engine = temporary_engine();
    let invitation = Invitation::new("JOIN42", OrganismId::new(), Utc::now() + TimeDelta::days(7));
    engine.add_invitation(&invitation).await.unwrap();

    let duplicate = engine.add_invitation(&invitation).await;
    assert!(matches!(duplicate, Err(StoreError::Duplicate { .. })));

    let accepted_at = Utc::now();
    let updated = engine
        .update_invitation(
            "JOIN42",
            &InvitationUpdate {
                status: Some(InvitationStatus::Accepted),
                accepted_by: Some(String::from("friend")),
                accepted_at: Some(accepted_at),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, InvitationStatus::Accepted);

    let stored = engine.get_invitation("JOIN42").await.unwrap().unwrap();
    assert_eq!(stored, updated);
    assert_eq!(engine.get_all_invitations().await.unwrap().len(), 1);

    let missing = engine
        .update_invitation("NOPE", &InvitationUpdate::default())
        .await;
    assert!(matches!(missing, Err(StoreError::NotFound { .. })));
}

// =============================================================================
// Activity and retention
// =============================================================================

#[tokio::test]
async fn recent_activity_respects_window() {
    let engine = temporary_engine();
    engine
        .save_behavior(&behavior("https://fresh.test/", 1, 0, TimeDelta::minutes(10)))
        .await
        .unwrap();
    engine
        .save_behavior(&behavior("https://stale.test/", 1, 0, TimeDelta::days(3)))
        .await
        .unwrap();

    let organism = OrganismId::new();
    let fresh = Mutation::new(organism, "trait_shift", "fresh");
    let mut stale = Mutation::new(organism, "trait_shift", "stale");
    stale.timestamp = Utc::now() - TimeDelta::days(3);
    engine.add_mutation(&fresh).await.unwrap();
    engine.add_mutation(&stale).await.unwrap();

    let activity = engine
        .get_recent_activity(Duration::from_secs(24 * 60 * 60))
        .await
        .unwrap();
    assert_eq!(activity.period_ms, 86_400_000);
    assert_eq!(activity.behaviors.len(), 1);
    assert_eq!(activity.behaviors[0].url, "https://fresh.test/");
    assert_eq!(activity.mutations.len(), 1);
    assert_eq!(activity.mutations[0].description, "fresh");
}

#[tokio::test]
async fn cleanup_removes_old_records_and_expires_invitations() {
    let engine = temporary_engine();
    engine
        .save_behavior(&behavior("https://old.test/", 1, 0, TimeDelta::days(40)))
        .await
        .unwrap();
    engine
        .save_behavior(&behavior("https://new.test/", 1, 0, TimeDelta::days(1)))
        .await
        .unwrap();

    let organism = OrganismId::new();
    let mut old = Mutation::new(organism, "trait_shift", "old");
    old.timestamp = Utc::now() - TimeDelta::days(45);
    engine.add_mutation(&old).await.unwrap();
    engine
        .add_mutation(&Mutation::new(organism, "trait_shift", "new"))
        .await
        .unwrap();

    let lapsed = Invitation::new("LAPSED", organism, Utc::now() - TimeDelta::hours(1));
    let open = Invitation::new("OPEN", organism, Utc::now() + TimeDelta::days(1));
    engine.add_invitation(&lapsed).await.unwrap();
    engine.add_invitation(&open).await.unwrap();

    let report = engine.cleanup(30).await.unwrap();
    assert_eq!(report.behaviors_removed, 1);
    assert_eq!(report.mutations_removed, 1);
    assert_eq!(report.invitations_expired, 1);

    let stats = engine.get_storage_stats().await.unwrap();
    assert_eq!(stats.behaviors, 1);
    assert_eq!(stats.mutations, 1);
    assert_eq!(stats.invitations, 2);

    let lapsed = engine.get_invitation("LAPSED").await.unwrap().unwrap();
    assert_eq!(lapsed.status, InvitationStatus::Expired);
    let open = engine.get_invitation("OPEN").await.unwrap().unwrap();
    assert_eq!(open.status, InvitationStatus::Pending);

    // A second sweep finds nothing left to do.
    let report = engine.cleanup(30).await.unwrap();
    assert_eq!(report.behaviors_removed, 0);
    assert_eq!(report.invitations_expired, 0);
}
