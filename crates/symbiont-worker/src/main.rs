//! Execution-context host for the Symbiont storage layer.
//!
//! One process plays one context. The background context owns the embedded
//! database and answers storage requests arriving over NATS; the popup and
//! content-script contexts reach the same database as proxies.
//!
//! ```text
//! symbiont-worker [background | popup | content_script]
//! ```
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `symbiont-config.yaml` plus environment
//!    overrides; a positional argument overrides the context kind
//! 2. Initialize structured logging (tracing)
//! 3. Connect to NATS and resolve the storage role
//! 4. Build the process-wide coordinator
//! 5. Run the context until it finishes or Ctrl-C arrives
//! 6. Drain queued writes and release the coordinator

mod error;
mod visits;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use symbiont_sync::config::default_config_path;
use symbiont_sync::{
    ContextKind, CoordinatorFactory, DebounceConfig, LoggingConfig, NatsChannel,
    StorageCoordinator, SyncConfig, WriteDebouncer,
};
use symbiont_types::{BehaviorPattern, Organism, OwnerPresence, StorageStats};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::WorkerError;
use crate::visits::{Visit, VisitTracker};

/// How many domains the popup status report lists.
const TOP_DOMAINS: usize = 5;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if startup fails or the context stops abnormally.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let (config, config_path) = load_config()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging);
    info!(context = %config.context, "symbiont-worker starting");
    info!(
        config_file = ?config_path,
        "Configuration loaded"
    );

    // 3. Connect to NATS.
    let channel = NatsChannel::connect(
        &config.channel.nats_url,
        config.channel.subject_prefix.clone(),
    )
    .await
    .map_err(WorkerError::from)?;

    // 4. Build the coordinator for this context.
    let context = config.context;
    let debounce = config.debounce;
    let mut factory = CoordinatorFactory::new(config, Arc::new(channel));
    info!(%context, role = %factory.role(), "Storage role resolved");
    let coordinator = factory.get_instance().await.map_err(WorkerError::from)?;

    // 5. Run the context.
    let outcome = match context {
        ContextKind::Background => serve(&coordinator).await,
        ContextKind::Popup => report(&coordinator).await,
        ContextKind::ContentScript => ingest_visits(Arc::clone(&coordinator), debounce).await,
    };

    // 6. Release the coordinator (owner: detach listener, flush engine).
    drop(coordinator);
    factory.reset().await.map_err(WorkerError::from)?;
    outcome?;

    info!("symbiont-worker shutdown complete");
    Ok(())
}

/// Load `symbiont-config.yaml` if present, apply environment overrides, then
/// the optional context argument.
///
/// Returns the config and the path it was read from.
fn load_config() -> Result<(SyncConfig, Option<PathBuf>), WorkerError> {
    let path = default_config_path();
    let (mut config, source) = if path.exists() {
        (SyncConfig::from_file(&path)?, Some(path))
    } else {
        let mut config = SyncConfig::default();
        config.apply_env_overrides()?;
        (config, None)
    };

    if let Some(arg) = std::env::args().nth(1) {
        config.context = arg
            .parse()
            .map_err(|()| WorkerError::Usage { argument: arg })?;
    }
    Ok((config, source))
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Owner context: answer requests until Ctrl-C.
async fn serve(coordinator: &StorageCoordinator) -> Result<(), WorkerError> {
    let stats = coordinator.get_storage_stats().await?;
    let presence = coordinator.ping().await?;
    info!(
        instance_id = presence.instance_id,
        organisms = stats.organisms,
        behaviors = stats.behaviors,
        mutations = stats.mutations,
        size_on_disk_bytes = stats.size_on_disk_bytes,
        "Serving storage requests"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}

/// What the popup context prints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    owner: OwnerPresence,
    stats: StorageStats,
    organism: Option<Organism>,
    top_domains: Vec<BehaviorPattern>,
}

/// Popup context: print a status report of the store as JSON.
async fn report(coordinator: &StorageCoordinator) -> Result<(), WorkerError> {
    let owner = coordinator.ping().await?;
    let stats = coordinator.get_storage_stats().await?;
    let organism = coordinator.get_organism(None).await?;
    let mut top_domains = coordinator.get_behavior_patterns().await?;
    top_domains.truncate(TOP_DOMAINS);

    let report = StatusReport {
        owner,
        stats,
        organism,
        top_domains,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Content-script context: fold visit reports from stdin into behavior
/// records and save them through the write debouncer.
///
/// Stops at end of input or on Ctrl-C, then drains every queued write.
async fn ingest_visits(
    coordinator: Arc<StorageCoordinator>,
    debounce: DebounceConfig,
) -> Result<(), WorkerError> {
    let writer = WriteDebouncer::new(Arc::clone(&coordinator), debounce);
    let mut tracker = VisitTracker::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received");
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        let visit = match Visit::parse_line(&line) {
            None => continue,
            Some(Ok(visit)) => visit,
            Some(Err(e)) => {
                warn!(error = %e, "Skipping malformed visit report");
                continue;
            }
        };

        if !tracker.knows(&visit.url) {
            match coordinator.get_behavior(&visit.url).await {
                Ok(Some(stored)) => tracker.seed(stored),
                Ok(None) => {}
                Err(e) => warn!(url = visit.url, error = %e, "Could not load stored behavior"),
            }
        }
        // Failures surface through the debouncer's own logging.
        let _ticket = writer.save_behavior(tracker.record(visit));
    }

    let written = writer.dispose().await?;
    info!(
        written,
        tracked = tracker.tracked(),
        "Visit ingestion finished"
    );
    Ok(())
}
