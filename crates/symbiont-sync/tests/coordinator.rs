//! Integration tests for owner/proxy coordination over the in-process hub.
//!
//! Each test builds its own [`MemoryChannel`] and temporary database, so the
//! contexts of one test never see another test's traffic.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing
)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use symbiont_store::{SledEngine, StoreConfig};
use symbiont_sync::{
    Channel, ContextKind, CoordinatorFactory, MemoryChannel, MessageHandler, Reply, Role,
    StorageCoordinator, StorageError, SyncConfig,
};
use symbiont_types::{
    BehaviorRecord, CleanupReport, Invitation, InvitationStatus, InvitationUpdate, Mutation,
    Organism, StorageCommand, StorageRequest, StorageResponse,
};

fn config(context: ContextKind) -> SyncConfig {
    SyncConfig {
        context,
        storage: StoreConfig::temporary(),
        ..SyncConfig::default()
    }
}

async fn owner_on(channel: &MemoryChannel) -> StorageCoordinator {
    let engine = Arc::new(SledEngine::open(&StoreConfig::temporary()).expect("temporary db"));
    StorageCoordinator::owner(engine, channel)
        .await
        .expect("owner registers")
}

/// Claims every message and never answers.
struct Silent;

impl MessageHandler for Silent {
    fn on_message(&self, _message: &Value, _reply: Reply) -> bool {
        true
    }
}

/// Answers `STORAGE_GET_SETTING` with the key, after sleeping for the number
/// of milliseconds the key spells.
struct DelayedEcho;

impl MessageHandler for DelayedEcho {
    fn on_message(&self, message: &Value, reply: Reply) -> bool {
        let Ok(request) = serde_json::from_value::<StorageRequest>(message.clone()) else {
            return false;
        };
        let Ok(StorageCommand::GetSetting { key, .. }) = StorageCommand::from_request(&request)
        else {
            return false;
        };
        let delay = Duration::from_millis(key.parse().unwrap_or(0));
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            reply.send(StorageResponse::ok(&request.request_id, json!(key)));
        });
        true
    }
}

/// Answers every storage request with `null` one second after receiving it.
struct SlowOwner;

impl MessageHandler for SlowOwner {
    fn on_message(&self, message: &Value, reply: Reply) -> bool {
        let Ok(request) = serde_json::from_value::<StorageRequest>(message.clone()) else {
            return false;
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            reply.send(StorageResponse::ok(&request.request_id, Value::Null));
        });
        true
    }
}

// =============================================================================
// Operations through a proxy
// =============================================================================

#[tokio::test]
async fn proxy_reaches_every_operation() {
    let channel = Arc::new(MemoryChannel::new());
    let owner_factory = CoordinatorFactory::new(config(ContextKind::Background), channel.clone());
    let proxy_factory = CoordinatorFactory::new(config(ContextKind::Popup), channel.clone());

    let owner = owner_factory.get_instance().await.unwrap();
    let proxy = proxy_factory.get_instance().await.unwrap();
    assert_eq!(owner.role(), Role::Owner);
    assert_eq!(proxy.role(), Role::Proxy);

    // Organisms
    let organism = Organism::new("Mossback");
    proxy.save_organism(&organism).await.unwrap();
    assert_eq!(
        proxy.get_organism(Some(organism.id)).await.unwrap(),
        Some(organism.clone())
    );
    assert_eq!(owner.get_organism(None).await.unwrap(), Some(organism.clone()));

    // Behavior
    let first = BehaviorRecord::first_visit("https://a.example/one");
    let second = BehaviorRecord::first_visit("https://a.example/two");
    proxy.save_behavior(&first).await.unwrap();
    proxy.save_behavior(&second).await.unwrap();
    assert_eq!(proxy.get_behavior(&first.url).await.unwrap(), Some(first.clone()));
    assert_eq!(proxy.get_behavior("https://nowhere.example/").await.unwrap(), None);

    let patterns = proxy.get_behavior_patterns().await.unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].domain, "a.example");
    assert_eq!(patterns[0].urls, 2);

    // Mutations
    for kind in ["grow", "split", "shed"] {
        proxy
            .add_mutation(&Mutation::new(organism.id, kind, "tick"))
            .await
            .unwrap();
    }
    assert_eq!(proxy.get_recent_mutations(2).await.unwrap().len(), 2);

    let activity = proxy
        .get_recent_activity(Duration::from_secs(3_600))
        .await
        .unwrap();
    assert_eq!(activity.behaviors.len(), 2);
    assert_eq!(activity.mutations.len(), 3);

    // Settings
    assert_eq!(
        proxy.get_setting("theme", json!("dark")).await.unwrap(),
        json!("dark")
    );
    proxy.set_setting("theme", json!("light")).await.unwrap();
    assert_eq!(
        proxy.get_setting("theme", json!("dark")).await.unwrap(),
        json!("light")
    );

    // Invitations
    let expires_at = chrono::Utc::now() + chrono::TimeDelta::days(7);
    let invitation = Invitation::new("JOIN-1", organism.id, expires_at);
    proxy.add_invitation(&invitation).await.unwrap();
    assert!(matches!(
        proxy.add_invitation(&invitation).await,
        Err(StorageError::Remote { .. })
    ));
    let accepted = proxy
        .update_invitation(
            "JOIN-1",
            InvitationUpdate {
                status: Some(InvitationStatus::Accepted),
                accepted_by: Some(String::from("friend")),
                accepted_at: Some(chrono::Utc::now()),
            },
        )
        .await
        .unwrap();
    assert_eq!(accepted.status, InvitationStatus::Accepted);
    assert_eq!(proxy.get_invitation("JOIN-1").await.unwrap(), Some(accepted));
    assert_eq!(proxy.get_all_invitations().await.unwrap().len(), 1);
    assert!(matches!(
        proxy
            .update_invitation("NOPE", InvitationUpdate::default())
            .await,
        Err(StorageError::Remote { .. })
    ));

    // Maintenance
    let stats = proxy.get_storage_stats().await.unwrap();
    assert_eq!(
        (
            stats.organisms,
            stats.behaviors,
            stats.mutations,
            stats.settings,
            stats.invitations
        ),
        (1, 2, 3, 1, 1)
    );
    assert_eq!(proxy.cleanup(30).await.unwrap(), CleanupReport::default());
    assert_eq!(
        proxy.ping().await.unwrap().instance_id,
        owner.ping().await.unwrap().instance_id
    );
    assert_eq!(proxy.pending_requests(), 0);
}

// =============================================================================
// Correlation and timeouts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn responses_are_matched_by_request_id() {
    let channel = MemoryChannel::new();
    let _owner = channel.register_owner(Arc::new(DelayedEcho)).await.unwrap();
    let proxy = StorageCoordinator::proxy(&channel, Duration::from_secs(30))
        .await
        .unwrap();

    // Replies arrive in the order 100, 200, 300.
    let (slow, fast, medium) = tokio::join!(
        proxy.get_setting("300", Value::Null),
        proxy.get_setting("100", Value::Null),
        proxy.get_setting("200", Value::Null),
    );
    assert_eq!(slow.unwrap(), json!("300"));
    assert_eq!(fast.unwrap(), json!("100"));
    assert_eq!(medium.unwrap(), json!("200"));
    assert_eq!(proxy.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_clears_the_pending_request() {
    let channel = MemoryChannel::new();
    let silent = channel.register_owner(Arc::new(Silent)).await.unwrap();
    let proxy = StorageCoordinator::proxy(&channel, Duration::from_secs(30))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let outcome = proxy.get_storage_stats().await;
    assert!(matches!(
        outcome,
        Err(StorageError::Timeout {
            timeout_ms: 30_000,
            ..
        })
    ));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(proxy.pending_requests(), 0);

    // A real owner takes over; the same proxy keeps working.
    silent.unregister();
    let _owner = owner_on(&channel).await;
    assert!(proxy.get_storage_stats().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn late_reply_does_not_disturb_later_calls() {
    let channel = MemoryChannel::new();
    let _owner = channel.register_owner(Arc::new(DelayedEcho)).await.unwrap();
    let proxy = StorageCoordinator::proxy(&channel, Duration::from_secs(1))
        .await
        .unwrap();

    assert!(matches!(
        proxy.get_setting("5000", Value::Null).await,
        Err(StorageError::Timeout { .. })
    ));
    assert_eq!(proxy.get_setting("10", Value::Null).await.unwrap(), json!("10"));

    // Let the abandoned reply arrive, then call again.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(proxy.get_setting("20", Value::Null).await.unwrap(), json!("20"));
    assert_eq!(proxy.pending_requests(), 0);
}

#[tokio::test]
async fn unreachable_owner_fails_immediately() {
    let channel = MemoryChannel::new();
    let _owner = owner_on(&channel).await;
    let proxy = StorageCoordinator::proxy(&channel, Duration::from_secs(30))
        .await
        .unwrap();

    channel.set_reachable(false);
    let outcome = tokio::time::timeout(Duration::from_secs(1), proxy.get_storage_stats())
        .await
        .expect("fails without waiting for the request timeout");
    assert!(matches!(outcome, Err(StorageError::Channel { .. })));
    assert_eq!(proxy.pending_requests(), 0);

    channel.set_reachable(true);
    assert!(proxy.get_storage_stats().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn owner_lost_after_posting_times_out() {
    let channel = MemoryChannel::new();
    let _owner = channel.register_owner(Arc::new(SlowOwner)).await.unwrap();
    let proxy = StorageCoordinator::proxy(&channel, Duration::from_secs(30))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let (outcome, ()) = tokio::join!(proxy.get_organism(None), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.set_reachable(false);
    });
    assert!(matches!(
        outcome,
        Err(StorageError::Timeout {
            timeout_ms: 30_000,
            ..
        })
    ));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(proxy.pending_requests(), 0);
}

#[tokio::test]
async fn proxy_without_owner_fails_immediately() {
    let channel = MemoryChannel::new();
    let proxy = StorageCoordinator::proxy(&channel, Duration::from_secs(30))
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(1), proxy.get_organism(None))
        .await
        .expect("no listener is reported at once");
    assert!(matches!(outcome, Err(StorageError::Channel { .. })));
}

// =============================================================================
// Roles
// =============================================================================

#[tokio::test]
async fn second_owner_is_refused() {
    let channel = Arc::new(MemoryChannel::new());
    let first = CoordinatorFactory::new(config(ContextKind::Background), channel.clone());
    let second = CoordinatorFactory::new(config(ContextKind::Background), channel.clone());

    let owner = first.get_instance().await.unwrap();
    let expected = owner.ping().await.unwrap().instance_id;
    match second.get_instance().await {
        Err(StorageError::OwnerConflict { instance_id }) => assert_eq!(instance_id, expected),
        other => panic!("expected an owner conflict, got {other:?}"),
    }
    assert_eq!(channel.listener_count(), 1);
}

#[tokio::test]
async fn foreign_messages_pass_through() {
    let channel = MemoryChannel::new();
    let _owner = owner_on(&channel).await;
    assert!(!channel.broadcast(&json!({"type": "TAB_UPDATED", "tabId": 12})));
    assert!(!channel.broadcast(&json!({"action": "refresh"})));
}

#[tokio::test]
async fn closed_proxy_rejects_calls() {
    let channel = MemoryChannel::new();
    let _owner = owner_on(&channel).await;
    let proxy = StorageCoordinator::proxy(&channel, Duration::from_secs(30))
        .await
        .unwrap();
    proxy.close().await.unwrap();
    assert_eq!(proxy.get_storage_stats().await, Err(StorageError::Closed));
}

#[test]
fn every_context_kind_resolves_to_one_role() {
    let owners: Vec<ContextKind> = [
        ContextKind::Background,
        ContextKind::Popup,
        ContextKind::ContentScript,
    ]
    .into_iter()
    .filter(|kind| kind.role() == Role::Owner)
    .collect();
    assert_eq!(owners, vec![ContextKind::Background]);
}
