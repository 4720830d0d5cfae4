//! Per-key write coalescing with a staleness ceiling.
//!
//! [`Debouncer`] sits between chatty call sites and a write sink. Every
//! [`Debouncer::push`] for a key replaces the value waiting for that key and
//! restarts the key's quiet-period timer; only the latest value is written
//! when the timer fires. Under continuous updates the timer is capped so a
//! queued value never waits longer than `max_pending` after it was first
//! queued.
//!
//! Writes for one key never overlap. If a key's timer fires while an earlier
//! write for the same key is still running, the new value is marked due and
//! written by the running task as soon as the earlier write finishes.
//!
//! ```text
//! push(k, v1) ── push(k, v2) ──────── timer ──> flush(v2)
//!      |<-------- window ------>|          (v1 is never written)
//! ```

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::DebounceConfig;
use crate::error::StorageError;

/// Outcome of one physical write, shared by every push it carried.
pub type WriteResult = Result<(), StorageError>;

/// The sink a [`Debouncer`] writes coalesced values to.
pub type FlushFn<V> = Arc<dyn Fn(V) -> BoxFuture<'static, WriteResult> + Send + Sync>;

/// Resolves once the value handed to [`Debouncer::push`] (or a later value
/// for the same key that replaced it) has been written.
///
/// Dropping the ticket does not cancel the write.
#[must_use = "dropping a WriteTicket ignores the outcome of the write"]
pub struct WriteTicket {
    outcome: oneshot::Receiver<WriteResult>,
}

impl WriteTicket {
    fn settled(result: WriteResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { outcome: rx }
    }
}

impl fmt::Debug for WriteTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTicket").finish_non_exhaustive()
    }
}

impl Future for WriteTicket {
    type Output = WriteResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StorageError::Closed)))
    }
}

struct Queued<V> {
    data: V,
    first_queued_at: Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    /// The timer fired while an earlier write for the key was running.
    due: bool,
    waiters: Vec<oneshot::Sender<WriteResult>>,
}

impl<V> Queued<V> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct State<K, V> {
    entries: HashMap<K, Queued<V>>,
    /// Keys with a write in progress, with callers waiting for it to finish.
    writing: HashMap<K, Vec<oneshot::Sender<()>>>,
    next_generation: u64,
    closed: bool,
}

struct Inner<K, V> {
    name: &'static str,
    window: Duration,
    max_pending: Duration,
    flush: FlushFn<V>,
    state: Mutex<State<K, V>>,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timer body: write the entry if it still belongs to `generation`.
    async fn fire(self: Arc<Self>, key: K, generation: u64) {
        let entry = {
            let mut state = self.lock();
            let state = &mut *state;
            let current = state
                .entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation);
            if !current {
                return;
            }
            if state.writing.contains_key(&key) {
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.timer = None;
                    entry.due = true;
                }
                return;
            }
            state.writing.insert(key.clone(), Vec::new());
            state.entries.remove(&key)
        };
        if let Some(entry) = entry {
            self.write(key, entry).await;
        }
    }

    /// Write `entry`, then any entry for the same key that became due
    /// meanwhile. The caller has already marked `key` as writing.
    async fn write(&self, key: K, entry: Queued<V>) {
        let mut current = entry;
        loop {
            debug!(debouncer = self.name, key = ?key, "Flushing coalesced write");
            let result = (self.flush)(current.data).await;
            if let Err(e) = &result {
                warn!(debouncer = self.name, key = ?key, error = %e, "Debounced write failed");
            }
            for waiter in current.waiters {
                let _ = waiter.send(result.clone());
            }

            let next = {
                let mut state = self.lock();
                let state = &mut *state;
                let next_due = state.entries.get(&key).is_some_and(|entry| entry.due);
                let next = if next_due {
                    state.entries.remove(&key)
                } else {
                    None
                };
                if next.is_none() {
                    for waiter in state.writing.remove(&key).unwrap_or_default() {
                        let _ = waiter.send(());
                    }
                }
                next
            };
            match next {
                Some(entry) => current = entry,
                None => return,
            }
        }
    }
}

/// Coalesces writes per key and hands the survivors to a flush sink.
pub struct Debouncer<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> fmt::Debug for Debouncer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("name", &self.inner.name)
            .field("window", &self.inner.window)
            .field("max_pending", &self.inner.max_pending)
            .finish_non_exhaustive()
    }
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    V: Send + 'static,
{
    /// Create a debouncer named `name` (used in logs) that writes through `flush`.
    pub fn new(
        name: &'static str,
        config: DebounceConfig,
        flush: impl Fn(V) -> BoxFuture<'static, WriteResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                window: config.window(),
                max_pending: config.max_pending(),
                flush: Arc::new(flush),
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    writing: HashMap::new(),
                    next_generation: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Queue `value` as the latest state of `key`.
    ///
    /// The write happens once the key has been quiet for the debounce
    /// window, or at once if the key's first queued value has already waited
    /// the maximum pending duration. Must be called from within a tokio
    /// runtime.
    pub fn push(&self, key: K, value: V) -> WriteTicket {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut state = self.inner.lock();
        if state.closed {
            return WriteTicket::settled(Err(StorageError::Closed));
        }

        let state = &mut *state;
        state.next_generation = state.next_generation.wrapping_add(1);
        let generation = state.next_generation;

        let entry = match state.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                // Replacing a queued value keeps its first-queued time.
                let entry = occupied.into_mut();
                entry.cancel_timer();
                entry.data = value;
                entry.generation = generation;
                entry.due = false;
                entry
            }
            Entry::Vacant(vacant) => vacant.insert(Queued {
                data: value,
                first_queued_at: now,
                generation,
                timer: None,
                due: false,
                waiters: Vec::new(),
            }),
        };
        entry.waiters.push(tx);

        let waited = now.saturating_duration_since(entry.first_queued_at);
        if waited >= self.inner.max_pending {
            debug!(
                debouncer = self.inner.name,
                key = ?key,
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                "Queued write reached its maximum age"
            );
            if state.writing.contains_key(&key) {
                entry.due = true;
            } else if let Some(entry) = state.entries.remove(&key) {
                state.writing.insert(key.clone(), Vec::new());
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.write(key, entry).await });
            }
        } else {
            let delay = self
                .inner
                .window
                .min(self.inner.max_pending.saturating_sub(waited));
            let inner = Arc::clone(&self.inner);
            entry.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.fire(key, generation).await;
            }));
        }

        WriteTicket { outcome: rx }
    }

    /// Number of keys with a queued value.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Write every queued value now and wait for all writes, including
    /// writes already in progress, to finish.
    ///
    /// Returns how many queued values were written.
    ///
    /// # Errors
    ///
    /// Returns the first write failure; every other write still runs to
    /// completion and queued entries are cleared regardless.
    pub async fn flush_all(&self) -> Result<usize, StorageError> {
        let mut tickets = Vec::new();
        let mut finished = Vec::new();
        let mut ready = Vec::new();
        {
            let mut state = self.inner.lock();
            let state = &mut *state;

            for waiters in state.writing.values_mut() {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                finished.push(rx);
            }

            let keys: Vec<K> = state.entries.keys().cloned().collect();
            for key in keys {
                let busy = state.writing.contains_key(&key);
                let Some(entry) = state.entries.get_mut(&key) else {
                    continue;
                };
                entry.cancel_timer();
                let (tx, rx) = oneshot::channel();
                entry.waiters.push(tx);
                tickets.push(WriteTicket { outcome: rx });

                if busy {
                    entry.due = true;
                } else if let Some(entry) = state.entries.remove(&key) {
                    state.writing.insert(key.clone(), Vec::new());
                    ready.push((key, entry));
                }
            }
        }

        debug!(
            debouncer = self.inner.name,
            queued = tickets.len(),
            in_progress = finished.len(),
            "Flushing all queued writes"
        );
        for (key, entry) in ready {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.write(key, entry).await });
        }

        let flushed = tickets.len();
        let mut first_error = None;
        for ticket in tickets {
            if let Err(e) = ticket.await {
                first_error.get_or_insert(e);
            }
        }
        for done in finished {
            let _ = done.await;
        }

        first_error.map_or(Ok(flushed), Err)
    }

    /// Refuse further pushes, then flush everything still queued.
    ///
    /// # Errors
    ///
    /// See [`Debouncer::flush_all`].
    pub async fn close(&self) -> Result<usize, StorageError> {
        self.inner.lock().closed = true;
        self.flush_all().await
    }

    /// Whether [`Debouncer::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing
)]
mod tests {
    use futures::FutureExt as _;

    use super::*;

    type Log = Arc<Mutex<Vec<(Duration, &'static str, u32)>>>;

    /// A debouncer over `(key, value)` pairs that records each write and
    /// the time it happened relative to `start`.
    fn recording(
        window_ms: u64,
        max_pending_ms: u64,
    ) -> (Debouncer<&'static str, (&'static str, u32)>, Log, Instant) {
        let log = Log::default();
        let start = Instant::now();
        let sink = Arc::clone(&log);
        let debouncer = Debouncer::new(
            "test",
            DebounceConfig {
                window_ms,
                max_pending_ms,
            },
            move |(key, value): (&'static str, u32)| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push((start.elapsed(), key, value));
                    Ok(())
                }
                .boxed()
            },
        );
        (debouncer, log, start)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_writes_coalesce_into_the_last_value() {
        let (debouncer, log, _) = recording(2_000, 10_000);

        let first = debouncer.push("o1", ("o1", 10));
        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = debouncer.push("o1", ("o1", 40));
        assert_eq!(debouncer.pending_count(), 1);

        first.await.unwrap();
        second.await.unwrap();

        let log = log.lock().unwrap().clone();
        assert_eq!(log, vec![(Duration::from_millis(2_500), "o1", 40)]);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let (debouncer, log, _) = recording(1_000, 10_000);
        let a = debouncer.push("a", ("a", 1));
        let b = debouncer.push("b", ("b", 2));
        assert_eq!(debouncer.pending_count(), 2);
        a.await.unwrap();
        b.await.unwrap();

        let mut writes: Vec<_> = log.lock().unwrap().iter().map(|w| (w.1, w.2)).collect();
        writes.sort_unstable();
        assert_eq!(writes, vec![("a", 1), ("b", 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_writes_flush_within_max_pending() {
        let (debouncer, log, _) = recording(2_000, 10_000);

        for value in 0..20 {
            let _ticket = debouncer.push("o1", ("o1", value));
            tokio::time::sleep(Duration::from_millis(1_500)).await;
        }

        let log = log.lock().unwrap().clone();
        let (at, _, value) = log.first().copied().unwrap();
        assert!(at <= Duration::from_millis(10_000), "first write at {at:?}");
        // The value queued at 9 000 ms is the last one before the ceiling.
        assert_eq!(value, 6);
        // Every write carried the newest value queued before it.
        assert!(log.windows(2).all(|pair| pair[0].2 < pair[1].2));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_pending_writes_immediately() {
        let (debouncer, log, _) = recording(2_000, 0);
        debouncer.push("o1", ("o1", 1)).await.unwrap();
        let log = log.lock().unwrap().clone();
        assert_eq!(log, vec![(Duration::ZERO, "o1", 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_drains_everything() {
        let (debouncer, log, _) = recording(60_000, 600_000);
        let _a = debouncer.push("a", ("a", 1));
        let _b = debouncer.push("b", ("b", 2));
        let _c = debouncer.push("a", ("a", 3));

        assert_eq!(debouncer.flush_all().await, Ok(2));
        assert_eq!(debouncer.pending_count(), 0);

        let mut writes: Vec<_> = log.lock().unwrap().iter().map(|w| (w.1, w.2)).collect();
        writes.sort_unstable();
        assert_eq!(writes, vec![("a", 3), ("b", 2)]);

        // Aborted timers never write again.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_failure_reaches_every_waiter() {
        let debouncer = Debouncer::new(
            "failing",
            DebounceConfig {
                window_ms: 100,
                max_pending_ms: 1_000,
            },
            |_: u32| {
                async {
                    Err(StorageError::Engine {
                        message: String::from("disk full"),
                    })
                }
                .boxed()
            },
        );

        let first = debouncer.push("k", 1);
        let second = debouncer.push("k", 2);
        let expected = Err(StorageError::Engine {
            message: String::from("disk full"),
        });
        assert_eq!(first.await, expected);
        assert_eq!(second.await, expected);
        assert_eq!(debouncer.pending_count(), 0);

        let _third = debouncer.push("k", 3);
        assert_eq!(debouncer.flush_all().await, expected.map(|()| 0));
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_for_one_key_never_overlap() {
        let active = Arc::new(Mutex::new((0_u32, 0_u32)));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (probe, sink) = (Arc::clone(&active), Arc::clone(&log));
        let debouncer = Debouncer::new(
            "slow",
            DebounceConfig {
                window_ms: 100,
                max_pending_ms: 1_000,
            },
            move |value: u32| {
                let (probe, sink) = (Arc::clone(&probe), Arc::clone(&sink));
                async move {
                    {
                        let mut counts = probe.lock().unwrap();
                        counts.0 += 1;
                        counts.1 = counts.1.max(counts.0);
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    probe.lock().unwrap().0 -= 1;
                    sink.lock().unwrap().push(value);
                    Ok(())
                }
                .boxed()
            },
        );

        let first = debouncer.push("k", 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        // The first write is now in progress; queue a replacement that
        // becomes due before it finishes.
        let second = debouncer.push("k", 2);
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(active.lock().unwrap().1, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_debouncer_rejects_pushes() {
        let (debouncer, log, _) = recording(2_000, 10_000);
        let queued = debouncer.push("a", ("a", 1));
        assert_eq!(debouncer.close().await, Ok(1));
        queued.await.unwrap();
        assert!(debouncer.is_closed());

        let rejected = debouncer.push("a", ("a", 2)).await;
        assert_eq!(rejected, Err(StorageError::Closed));
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
