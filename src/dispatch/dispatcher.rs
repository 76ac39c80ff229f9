use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use uuid::Uuid;

use super::dead_letter::DeadLetterQueue;
use super::journal::{EventJournal, JournalError, QueuedEvent};
use crate::config::DispatcherConfig;
use crate::domain::order::{OrderKey, OrderStatusEvent};
use crate::metrics::Metrics;
use crate::reconciliation::{ReconciliationEngine, ReconciliationError};
use crate::utils::{retry_on_transient, RetryResult};

// ============================================================================
// Event Dispatcher
// ============================================================================
//
// Per-key FIFO queues in front of a bounded pool of reconciliation workers.
//
// - One task per live order key drains that key's queue, so at most one
//   reconciliation per order runs at a time and events keep submission order
// - A shared semaphore caps concurrent reconciliations across keys
// - Submits for a live key only take a read guard on the queue map; the
//   write guard is for creating and evicting key queues
// - Idle key queues are evicted after `idle_eviction`
//
// ============================================================================

const RECONCILE_OPERATION: &str = "reconcile";

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// The key's queue stayed full for the whole submit timeout
    #[error("Queue for order {key} is full")]
    Overloaded { key: String },

    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Events still queued when the dispatcher was drained. They remain in the
/// journal and are resubmitted on the next start.
#[derive(Debug, thiserror::Error)]
#[error("{} events left undelivered at shutdown", .0.len())]
pub struct Undelivered(pub Vec<QueuedEvent>);

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherSnapshot {
    pub accepting: bool,
    pub active_keys: usize,
    pub dead_letters: usize,
}

/// How an entry enters its key queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Fresh webhook event. Bounded wait for space, journaled before queueing
    Submitted,
    /// Journal entry from a previous run. Waits for space as long as it takes
    Recovered,
    /// Dead letter going around again. Bounded wait, already journaled
    Replayed,
}

struct KeyQueue {
    tx: mpsc::Sender<QueuedEvent>,
}

struct Inner {
    engine: Arc<ReconciliationEngine>,
    journal: Arc<dyn EventJournal>,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<Metrics>,
    config: DispatcherConfig,
    permits: Semaphore,
    accepting: AtomicBool,
    shutdown: watch::Sender<bool>,
    queues: RwLock<HashMap<OrderKey, Arc<KeyQueue>>>,
    /// Only locked while holding the `queues` write guard, or by drain()
    workers: Mutex<JoinSet<Vec<QueuedEvent>>>,
    runtime: Handle,
}

#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl EventDispatcher {
    /// Key workers run on the runtime that creates the dispatcher, whatever
    /// runtime later calls `submit`. Must be called inside a Tokio runtime.
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        journal: Arc<dyn EventJournal>,
        dead_letters: Arc<DeadLetterQueue>,
        metrics: Arc<Metrics>,
        config: DispatcherConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                engine,
                journal,
                dead_letters,
                metrics,
                permits: Semaphore::new(config.workers.max(1)),
                config,
                accepting: AtomicBool::new(true),
                shutdown,
                queues: RwLock::new(HashMap::new()),
                workers: Mutex::new(JoinSet::new()),
                runtime: Handle::current(),
            }),
        }
    }

    /// Durably accept an event and queue it behind earlier events for the
    /// same order. Waits up to `submit_timeout` for queue space.
    pub async fn submit(&self, event: OrderStatusEvent) -> Result<Uuid, DispatchError> {
        self.inner.enqueue(QueuedEvent::new(event), Admission::Submitted).await
    }

    /// Resubmit everything the journal still holds, oldest first.
    /// Called once at startup before the webhook listener opens. A key with
    /// a backlog larger than its queue makes this wait for the worker.
    pub async fn recover(&self) -> Result<usize, DispatchError> {
        let pending = self.inner.journal.pending().await?;
        let total = pending.len();

        for entry in pending {
            self.inner.enqueue(entry, Admission::Recovered).await?;
        }

        if total > 0 {
            tracing::info!(recovered = total, "🔄 Resubmitted unfinished journal entries");
        }
        Ok(total)
    }

    /// Queue every dead letter again. Letters stay listed, keeping their
    /// failure history, until their event reconciles.
    pub async fn replay_dead_letters(&self) -> Result<usize, DispatchError> {
        let letters = self.inner.dead_letters.list().await;
        let mut replayed = 0;

        for letter in letters {
            if let Err(e) = self.inner.enqueue(letter.entry, Admission::Replayed).await {
                tracing::warn!(replayed = replayed, error = %e, "Dead letter replay interrupted");
                return Err(e);
            }
            replayed += 1;
        }

        tracing::info!(replayed = replayed, "Dead letters resubmitted");
        Ok(replayed)
    }

    pub async fn snapshot(&self) -> DispatcherSnapshot {
        let active_keys = self.inner.queues.read().await.len();

        DispatcherSnapshot {
            accepting: self.inner.accepting.load(Ordering::SeqCst),
            active_keys,
            dead_letters: self.inner.dead_letters.len().await,
        }
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.inner.dead_letters
    }

    /// Stop accepting, let each key worker finish its current event, and
    /// hand back whatever was still queued.
    pub async fn drain(&self) -> Result<(), Undelivered> {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        let mut workers = {
            let mut queues = self.inner.queues.write().await;
            queues.clear();
            std::mem::take(&mut *self.inner.workers.lock().await)
        };
        self.inner.metrics.set_active_key_queues(0);

        tracing::info!(workers = workers.len(), "🛑 Draining dispatcher");

        let mut leftovers = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(events) => leftovers.extend(events),
                Err(e) => tracing::error!(error = %e, "Key worker terminated abnormally"),
            }
        }
        leftovers.sort_by_key(|entry| entry.id);

        if leftovers.is_empty() {
            tracing::info!("Dispatcher drained cleanly");
            Ok(())
        } else {
            for entry in &leftovers {
                tracing::warn!(event_id = %entry.id, key = %entry.event.key(), "Event left undelivered");
            }
            Err(Undelivered(leftovers))
        }
    }
}

impl Inner {
    async fn enqueue(self: &Arc<Self>, entry: QueuedEvent, admission: Admission) -> Result<Uuid, DispatchError> {
        let key = entry.event.key();
        let queue = self.route(&key).await?;

        let reserved = match admission {
            Admission::Recovered => Ok(queue.tx.reserve().await),
            Admission::Submitted | Admission::Replayed => {
                timeout(self.config.submit_timeout, queue.tx.reserve()).await
            }
        };

        let permit = match reserved {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DispatchError::ShuttingDown),
            Err(_) => {
                tracing::warn!(key = %key, "Key queue full, rejecting event");
                return Err(DispatchError::Overloaded { key: key.to_string() });
            }
        };

        if admission == Admission::Submitted {
            self.journal.append(&entry).await?;
        }

        let id = entry.id;
        tracing::debug!(event_id = %id, key = %key, "Event queued");
        permit.send(entry);
        Ok(id)
    }

    /// Queue for `key`, spawning its worker on first use
    async fn route(self: &Arc<Self>, key: &OrderKey) -> Result<Arc<KeyQueue>, DispatchError> {
        {
            let queues = self.queues.read().await;
            if !self.accepting.load(Ordering::SeqCst) {
                return Err(DispatchError::ShuttingDown);
            }
            if let Some(queue) = queues.get(key) {
                return Ok(queue.clone());
            }
        }

        let mut queues = self.queues.write().await;

        // Checked under the write guard so drain() never misses a freshly spawned worker
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        if let Some(queue) = queues.get(key) {
            return Ok(queue.clone());
        }

        let mut workers = self.workers.lock().await;
        while let Some(finished) = workers.try_join_next() {
            if let Err(e) = finished {
                tracing::error!(error = %e, "Key worker terminated abnormally");
            }
        }

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        workers.spawn_on(
            run_key_worker(self.clone(), key.clone(), rx, self.shutdown.subscribe()),
            &self.runtime,
        );

        let queue = Arc::new(KeyQueue { tx });
        queues.insert(key.clone(), queue.clone());
        self.metrics.set_active_key_queues(queues.len());

        Ok(queue)
    }

    /// Drop the key's queue if nobody holds or fills it
    async fn try_evict(&self, key: &OrderKey, rx: &mpsc::Receiver<QueuedEvent>) -> bool {
        let mut queues = self.queues.write().await;

        // The map's handle is the only one left: no submit is in flight
        let unused = queues
            .get(key)
            .map_or(true, |queue| Arc::strong_count(queue) == 1);

        if unused && rx.is_empty() {
            queues.remove(key);
            self.metrics.set_active_key_queues(queues.len());
            tracing::trace!(key = %key, "Evicted idle key queue");
            true
        } else {
            false
        }
    }

    async fn process(&self, entry: QueuedEvent) {
        let _permit = self.permits.acquire().await.ok();
        let started = Instant::now();
        let platform = entry.event.platform;

        let engine = &self.engine;
        let event = &entry.event;
        let metrics = &self.metrics;
        let attempts = AtomicU32::new(0);
        let attempts_seen = &attempts;

        let result = retry_on_transient(&self.config.store_retry, move |attempt| {
            attempts_seen.store(attempt, Ordering::Relaxed);
            if attempt > 1 {
                metrics.record_retry_attempt(RECONCILE_OPERATION, attempt);
            }
            engine.reconcile(event)
        })
        .await;

        match result {
            RetryResult::Success(reconciled) => {
                if attempts.load(Ordering::Relaxed) > 1 {
                    metrics.record_retry_outcome(RECONCILE_OPERATION, true);
                }
                metrics.record_reconciled(
                    platform,
                    reconciled.disposition.as_str(),
                    started.elapsed().as_secs_f64(),
                );
                if let Err(e) = self.journal.acknowledge(entry.id).await {
                    tracing::warn!(event_id = %entry.id, error = %e, "Failed to acknowledge journal entry");
                }
                if let Some(letter) = self.dead_letters.resolve(entry.id).await {
                    tracing::info!(
                        event_id = %entry.id,
                        failure_count = letter.failure_count,
                        "Dead letter resolved on replay"
                    );
                }
            }
            RetryResult::Failed { error, attempts } => {
                metrics.record_retry_outcome(RECONCILE_OPERATION, false);
                self.dead_letter(entry, error, attempts).await;
            }
            RetryResult::PermanentFailure { error, attempts } => {
                self.dead_letter(entry, error, attempts).await;
            }
        }
    }

    async fn dead_letter(&self, entry: QueuedEvent, error: ReconciliationError, attempts: u32) {
        let platform = entry.event.platform;
        let message = format!("{} (after {} attempts)", error, attempts);

        self.dead_letters.push(entry, message).await;
        self.metrics.record_dead_letter(platform);
    }
}

async fn run_key_worker(
    inner: Arc<Inner>,
    key: OrderKey,
    mut rx: mpsc::Receiver<QueuedEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Vec<QueuedEvent> {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            next = timeout(inner.config.idle_eviction, rx.recv()) => match next {
                Ok(Some(entry)) => inner.process(entry).await,
                Ok(None) => return Vec::new(),
                Err(_) => {
                    if inner.try_evict(&key, &rx).await {
                        return Vec::new();
                    }
                }
            },
        }
    }

    // recv() keeps yielding until every outstanding send permit is used or dropped
    rx.close();
    let mut leftovers = Vec::new();
    while let Some(entry) = rx.recv().await {
        leftovers.push(entry);
    }
    leftovers
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{EventKind, Order, Platform};
    use crate::dispatch::InMemoryJournal;
    use crate::store::{InMemoryOrderStore, OrderStore, StoreError};
    use crate::utils::RetryConfig;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn event(order_id: &str, status: &str, ts: i64) -> OrderStatusEvent {
        OrderStatusEvent {
            platform: Platform::MarketplaceA,
            platform_order_id: order_id.to_string(),
            seller_id: "shop-1".to_string(),
            new_status: status.to_string(),
            event_timestamp: ts,
            raw_payload_digest: format!("{}-{}-{}", order_id, status, ts),
            kind: EventKind::order_status(),
        }
    }

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            workers: 4,
            queue_capacity: 16,
            submit_timeout: Duration::from_millis(50),
            idle_eviction: Duration::from_secs(30),
            store_retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            },
            max_conflict_retries: 3,
        }
    }

    struct Harness {
        dispatcher: EventDispatcher,
        journal: Arc<InMemoryJournal>,
        metrics: Arc<Metrics>,
    }

    fn harness(store: Arc<dyn OrderStore>, config: DispatcherConfig) -> Harness {
        let journal = Arc::new(InMemoryJournal::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let engine = Arc::new(ReconciliationEngine::new(store, config.max_conflict_retries));
        let dispatcher = EventDispatcher::new(
            engine,
            journal.clone(),
            Arc::new(DeadLetterQueue::new()),
            metrics.clone(),
            config,
        );
        Harness { dispatcher, journal, metrics }
    }

    async fn wait_until_settled(journal: &InMemoryJournal, dispatcher: &EventDispatcher, dead: usize) {
        for _ in 0..1000 {
            if journal.len().await == dead && dispatcher.dead_letters().len().await == dead {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dispatcher did not settle");
    }

    /// Blocks every read until the test opens the gate
    struct GatedStore {
        inner: InMemoryOrderStore,
        gate: Semaphore,
        entered: Notify,
    }

    impl GatedStore {
        fn new() -> Self {
            Self { inner: InMemoryOrderStore::new(), gate: Semaphore::new(0), entered: Notify::new() }
        }
    }

    #[async_trait]
    impl OrderStore for GatedStore {
        async fn find_by_key(&self, key: &OrderKey) -> Result<Option<Order>, StoreError> {
            self.entered.notify_one();
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.inner.find_by_key(key).await
        }

        async fn create_or_update(
            &self,
            order: Order,
            expected_updated_at: Option<DateTime<Utc>>,
        ) -> Result<Order, StoreError> {
            self.inner.create_or_update(order, expected_updated_at).await
        }
    }

    /// Holds appends once `gated` is set, until the test opens the gate
    struct GatedJournal {
        inner: InMemoryJournal,
        gated: AtomicBool,
        gate: Semaphore,
        entered: Notify,
    }

    impl GatedJournal {
        fn new() -> Self {
            Self {
                inner: InMemoryJournal::new(),
                gated: AtomicBool::new(false),
                gate: Semaphore::new(0),
                entered: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl EventJournal for GatedJournal {
        async fn append(&self, entry: &QueuedEvent) -> Result<(), JournalError> {
            if self.gated.load(Ordering::SeqCst) {
                self.entered.notify_one();
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
            }
            self.inner.append(entry).await
        }

        async fn acknowledge(&self, id: Uuid) -> Result<(), JournalError> {
            self.inner.acknowledge(id).await
        }

        async fn pending(&self) -> Result<Vec<QueuedEvent>, JournalError> {
            self.inner.pending().await
        }
    }

    #[tokio::test]
    async fn test_same_key_events_apply_in_submission_order() {
        let store = Arc::new(InMemoryOrderStore::new());
        let h = harness(store.clone(), test_config());

        h.dispatcher.submit(event("T1", "created", 1000)).await.unwrap();
        h.dispatcher.submit(event("T1", "shipped", 2000)).await.unwrap();
        h.dispatcher.submit(event("T1", "delivered", 3000)).await.unwrap();
        wait_until_settled(&h.journal, &h.dispatcher, 0).await;

        let orders = store.all().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, "delivered");
        // Each event was strictly newer, so each one wrote
        assert_eq!(store.write_count(), 3);
        assert!(h.dispatcher.drain().await.is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_reports_overloaded() {
        let store = Arc::new(GatedStore::new());
        let mut config = test_config();
        config.queue_capacity = 1;
        let h = harness(store.clone(), config);

        h.dispatcher.submit(event("T1", "a", 1)).await.unwrap();
        store.entered.notified().await;
        h.dispatcher.submit(event("T1", "b", 2)).await.unwrap();

        let err = h.dispatcher.submit(event("T1", "c", 3)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Overloaded { .. }));
        // Rejected before the journal saw it
        assert_eq!(h.journal.len().await, 2);

        // Other keys are unaffected
        h.dispatcher.submit(event("T2", "a", 1)).await.unwrap();

        store.gate.add_permits(100);
        wait_until_settled(&h.journal, &h.dispatcher, 0).await;
        let t1 = store.inner.find_by_key(&event("T1", "", 0).key()).await.unwrap().unwrap();
        assert_eq!(t1.status, "b");
    }

    #[tokio::test]
    async fn test_drain_returns_queued_events() {
        let store = Arc::new(GatedStore::new());
        let h = harness(store.clone(), test_config());

        h.dispatcher.submit(event("T1", "a", 1)).await.unwrap();
        store.entered.notified().await;
        let second = h.dispatcher.submit(event("T1", "b", 2)).await.unwrap();
        let third = h.dispatcher.submit(event("T1", "c", 3)).await.unwrap();

        let dispatcher = h.dispatcher.clone();
        let drain = tokio::spawn(async move { dispatcher.drain().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.gate.add_permits(100);

        let Undelivered(left) = drain.await.unwrap().unwrap_err();
        assert_eq!(left.iter().map(|e| e.id).collect::<Vec<_>>(), vec![second, third]);

        // In-flight event finished; the rest stay journaled for replay
        let t1 = store.inner.find_by_key(&event("T1", "", 0).key()).await.unwrap().unwrap();
        assert_eq!(t1.status, "a");
        assert_eq!(h.journal.len().await, 2);

        let err = h.dispatcher.submit(event("T2", "a", 1)).await.unwrap_err();
        assert!(matches!(err, DispatchError::ShuttingDown));
        assert!(!h.dispatcher.snapshot().await.accepting);
    }

    #[tokio::test]
    async fn test_transient_store_failures_are_retried() {
        let store = Arc::new(InMemoryOrderStore::new());
        store.fail_next(2);
        let h = harness(store.clone(), test_config());

        h.dispatcher.submit(event("T1", "shipped", 1000)).await.unwrap();
        wait_until_settled(&h.journal, &h.dispatcher, 0).await;

        assert_eq!(store.len().await, 1);
        let gathered = h.metrics.registry().gather();
        let attempts = gathered.iter().find(|m| m.name() == "retry_attempts_total").unwrap();
        assert_eq!(attempts.metric.len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_and_replay() {
        let store = Arc::new(InMemoryOrderStore::new());
        store.fail_next(3);
        let h = harness(store.clone(), test_config());

        h.dispatcher.submit(event("T1", "shipped", 1000)).await.unwrap();
        wait_until_settled(&h.journal, &h.dispatcher, 1).await;

        assert!(store.is_empty().await);
        let letters = h.dispatcher.dead_letters().list().await;
        assert_eq!(letters[0].failure_count, 1);
        assert_eq!(h.dispatcher.snapshot().await.dead_letters, 1);

        assert_eq!(h.dispatcher.replay_dead_letters().await.unwrap(), 1);
        wait_until_settled(&h.journal, &h.dispatcher, 0).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_failure_count_survives_replay() {
        let store = Arc::new(InMemoryOrderStore::new());
        store.fail_next(3);
        let h = harness(store.clone(), test_config());

        h.dispatcher.submit(event("T1", "shipped", 1000)).await.unwrap();
        wait_until_settled(&h.journal, &h.dispatcher, 1).await;
        let first = h.dispatcher.dead_letters().list().await.remove(0);

        store.fail_next(3);
        assert_eq!(h.dispatcher.replay_dead_letters().await.unwrap(), 1);

        let mut letters = h.dispatcher.dead_letters().list().await;
        for _ in 0..1000 {
            if letters[0].failure_count == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            letters = h.dispatcher.dead_letters().list().await;
        }

        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].entry.id, first.entry.id);
        assert_eq!(letters[0].failure_count, 2);
        assert_eq!(letters[0].first_failed_at, first.first_failed_at);
        assert!(letters[0].last_failed_at >= first.last_failed_at);

        // Third time round the store is healthy and the letter resolves
        assert_eq!(h.dispatcher.replay_dead_letters().await.unwrap(), 1);
        wait_until_settled(&h.journal, &h.dispatcher, 0).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_journal_failure_rejects_submit() {
        let store = Arc::new(InMemoryOrderStore::new());
        let h = harness(store.clone(), test_config());
        h.journal.fail_appends(true);

        let err = h.dispatcher.submit(event("T1", "shipped", 1000)).await.unwrap_err();

        assert!(matches!(err, DispatchError::Journal(_)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_recover_replays_pending_journal() {
        let store = Arc::new(InMemoryOrderStore::new());
        let h = harness(store.clone(), test_config());
        h.journal.append(&QueuedEvent::new(event("T1", "shipped", 1000))).await.unwrap();
        h.journal.append(&QueuedEvent::new(event("T1", "delivered", 2000))).await.unwrap();

        assert_eq!(h.dispatcher.recover().await.unwrap(), 2);
        wait_until_settled(&h.journal, &h.dispatcher, 0).await;

        assert_eq!(store.all().await[0].status, "delivered");
    }

    #[tokio::test]
    async fn test_recover_waits_out_a_backlog_larger_than_the_queue() {
        let store = Arc::new(GatedStore::new());
        let mut config = test_config();
        config.queue_capacity = 1;
        let h = harness(store.clone(), config);
        for n in 1..=4 {
            h.journal.append(&QueuedEvent::new(event("T1", &format!("s{}", n), n))).await.unwrap();
        }

        let dispatcher = h.dispatcher.clone();
        let recovering = tokio::spawn(async move { dispatcher.recover().await });
        store.entered.notified().await;

        // Well past submit_timeout with the queue still full
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!recovering.is_finished());

        store.gate.add_permits(100);
        assert_eq!(recovering.await.unwrap().unwrap(), 4);
        wait_until_settled(&h.journal, &h.dispatcher, 0).await;

        let t1 = store.inner.find_by_key(&event("T1", "", 0).key()).await.unwrap().unwrap();
        assert_eq!(t1.status, "s4");
    }

    #[tokio::test]
    async fn test_drain_collects_event_whose_journal_write_is_in_flight() {
        let store = Arc::new(InMemoryOrderStore::new());
        let journal = Arc::new(GatedJournal::new());
        let config = test_config();
        let engine = Arc::new(ReconciliationEngine::new(store.clone(), config.max_conflict_retries));
        let dispatcher = EventDispatcher::new(
            engine,
            journal.clone(),
            Arc::new(DeadLetterQueue::new()),
            Arc::new(Metrics::new().unwrap()),
            config,
        );

        dispatcher.submit(event("T1", "st1", 1)).await.unwrap();
        for _ in 0..1000 {
            if journal.inner.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(journal.inner.is_empty().await);

        journal.gated.store(true, Ordering::SeqCst);
        let submitter = dispatcher.clone();
        let submitting = tokio::spawn(async move { submitter.submit(event("T1", "st2", 2)).await });
        journal.entered.notified().await;

        let drainer = dispatcher.clone();
        let draining = tokio::spawn(async move { drainer.drain().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!draining.is_finished());

        journal.gate.add_permits(1);
        let accepted = submitting.await.unwrap().unwrap();
        let Undelivered(left) = draining.await.unwrap().unwrap_err();

        assert_eq!(left.iter().map(|e| e.id).collect::<Vec<_>>(), vec![accepted]);
        assert_eq!(journal.inner.pending().await.unwrap()[0].id, accepted);
        let t1 = store.find_by_key(&event("T1", "", 0).key()).await.unwrap().unwrap();
        assert_eq!(t1.status, "st1");
    }

    #[tokio::test]
    async fn test_submit_to_live_key_skips_worker_creation() {
        let store = Arc::new(InMemoryOrderStore::new());
        let h = harness(store.clone(), test_config());
        h.dispatcher.submit(event("T1", "a", 1)).await.unwrap();

        let creating = h.dispatcher.inner.workers.lock().await;

        let live = timeout(Duration::from_secs(1), h.dispatcher.submit(event("T1", "b", 2))).await;
        assert!(matches!(live, Ok(Ok(_))));

        let fresh = timeout(Duration::from_millis(50), h.dispatcher.submit(event("T2", "a", 1))).await;
        assert!(fresh.is_err());

        drop(creating);
        h.dispatcher.submit(event("T2", "a", 1)).await.unwrap();
        wait_until_settled(&h.journal, &h.dispatcher, 0).await;
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_idle_key_queue_is_evicted() {
        let store = Arc::new(InMemoryOrderStore::new());
        let mut config = test_config();
        config.idle_eviction = Duration::from_millis(10);
        let h = harness(store.clone(), config);

        h.dispatcher.submit(event("T1", "shipped", 1000)).await.unwrap();
        wait_until_settled(&h.journal, &h.dispatcher, 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.dispatcher.snapshot().await.active_keys, 0);

        // A later event for the same key gets a fresh queue
        h.dispatcher.submit(event("T1", "delivered", 2000)).await.unwrap();
        wait_until_settled(&h.journal, &h.dispatcher, 0).await;
        assert_eq!(store.all().await[0].status, "delivered");
    }
}
