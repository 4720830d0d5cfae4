//! Debounced persistence of organism and behavior state.
//!
//! Organism state changes on almost every simulation tick and behavior
//! records on every page interaction. [`WriteDebouncer`] coalesces both
//! streams per record (`organism-{id}` and `behavior-{url}`) and writes
//! only the latest state through the shared [`StorageCoordinator`].

use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt as _;
use serde::Serialize;
use symbiont_types::{BehaviorRecord, Organism};
use tracing::info;

use crate::config::DebounceConfig;
use crate::coordinator::StorageCoordinator;
use crate::debounce::{Debouncer, WriteTicket};
use crate::error::StorageError;

type CoordinatorSlot = Arc<RwLock<Option<Arc<StorageCoordinator>>>>;

/// Queued writes per record kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCount {
    /// Organisms with a queued write.
    pub organisms: usize,
    /// Behavior records with a queued write.
    pub behaviors: usize,
    /// Sum of both.
    pub total: usize,
}

/// Coalesces organism and behavior saves before they reach storage.
#[derive(Debug)]
pub struct WriteDebouncer {
    organisms: Debouncer<String, Organism>,
    behaviors: Debouncer<String, BehaviorRecord>,
    coordinator: CoordinatorSlot,
}

impl WriteDebouncer {
    /// Debounce writes to `coordinator` with the given timings.
    pub fn new(coordinator: Arc<StorageCoordinator>, config: DebounceConfig) -> Self {
        let slot: CoordinatorSlot = Arc::new(RwLock::new(Some(coordinator)));

        let target = Arc::clone(&slot);
        let organisms = Debouncer::new("organisms", config, move |organism: Organism| {
            let coordinator = current(&target);
            async move { coordinator?.save_organism(&organism).await }.boxed()
        });

        let target = Arc::clone(&slot);
        let behaviors = Debouncer::new("behaviors", config, move |behavior: BehaviorRecord| {
            let coordinator = current(&target);
            async move { coordinator?.save_behavior(&behavior).await }.boxed()
        });

        Self {
            organisms,
            behaviors,
            coordinator: slot,
        }
    }

    /// Queue `organism` for saving; earlier queued states of the same
    /// organism are superseded.
    pub fn save_organism(&self, organism: &Organism) -> WriteTicket {
        self.organisms
            .push(format!("organism-{}", organism.id), organism.clone())
    }

    /// Queue `behavior` for saving; earlier queued states of the same URL
    /// are superseded.
    pub fn save_behavior(&self, behavior: &BehaviorRecord) -> WriteTicket {
        self.behaviors
            .push(format!("behavior-{}", behavior.url), behavior.clone())
    }

    /// Write everything queued now and wait for it.
    ///
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns the first write failure. Both queues are drained regardless.
    pub async fn flush_all(&self) -> Result<usize, StorageError> {
        let (organisms, behaviors) =
            tokio::join!(self.organisms.flush_all(), self.behaviors.flush_all());
        Ok(organisms?.saturating_add(behaviors?))
    }

    /// Counts of queued writes.
    pub fn get_pending_count(&self) -> PendingCount {
        let organisms = self.organisms.pending_count();
        let behaviors = self.behaviors.pending_count();
        PendingCount {
            organisms,
            behaviors,
            total: organisms.saturating_add(behaviors),
        }
    }

    /// Flush everything queued, refuse further saves and release the
    /// coordinator.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the final flush. The coordinator is
    /// released either way.
    pub async fn dispose(&self) -> Result<usize, StorageError> {
        let (organisms, behaviors) =
            tokio::join!(self.organisms.close(), self.behaviors.close());
        self.coordinator
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let written = organisms?.saturating_add(behaviors?);
        info!(written, "Write debouncer disposed");
        Ok(written)
    }
}

fn current(slot: &CoordinatorSlot) -> Result<Arc<StorageCoordinator>, StorageError> {
    let coordinator = slot
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    coordinator.ok_or(StorageError::Closed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use symbiont_store::{SledEngine, StoreConfig};

    use super::*;
    use crate::channel::MemoryChannel;

    async fn owner() -> Arc<StorageCoordinator> {
        let engine = Arc::new(SledEngine::open(&StoreConfig::temporary()).unwrap());
        Arc::new(
            StorageCoordinator::owner(engine, &MemoryChannel::new())
                .await
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn organism_updates_coalesce() {
        let coordinator = owner().await;
        let writer = WriteDebouncer::new(Arc::clone(&coordinator), DebounceConfig::default());

        let mut organism = Organism::new("Blob");
        organism.energy = 10;
        let first = writer.save_organism(&organism);
        organism.energy = 40;
        let second = writer.save_organism(&organism);
        assert_eq!(writer.get_pending_count().organisms, 1);

        first.await.unwrap();
        second.await.unwrap();
        let stored = coordinator.get_organism(Some(organism.id)).await.unwrap();
        assert_eq!(stored.map(|o| o.energy), Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_count_spans_both_kinds() {
        let writer = WriteDebouncer::new(owner().await, DebounceConfig::default());
        let _a = writer.save_organism(&Organism::new("A"));
        let _b = writer.save_behavior(&BehaviorRecord::first_visit("https://a.example/1"));
        let _c = writer.save_behavior(&BehaviorRecord::first_visit("https://a.example/2"));
        assert_eq!(
            writer.get_pending_count(),
            PendingCount {
                organisms: 1,
                behaviors: 2,
                total: 3,
            }
        );

        assert_eq!(writer.flush_all().await, Ok(3));
        assert_eq!(writer.get_pending_count(), PendingCount::default());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_flushes_and_then_rejects() {
        let coordinator = owner().await;
        let writer = WriteDebouncer::new(Arc::clone(&coordinator), DebounceConfig::default());
        let behavior = BehaviorRecord::first_visit("https://news.example/today");
        let _queued = writer.save_behavior(&behavior);

        assert_eq!(writer.dispose().await, Ok(1));
        let stored = coordinator.get_behavior(&behavior.url).await.unwrap();
        assert_eq!(stored, Some(behavior.clone()));

        assert_eq!(
            writer.save_behavior(&behavior).await,
            Err(StorageError::Closed)
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(writer.get_pending_count().total, 0);
    }
}
