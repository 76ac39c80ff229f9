use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use scylla::client::session::Session;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::order::OrderStatusEvent;

// ============================================================================
// Event Journal
// ============================================================================
//
// An event is appended here before it enters a key queue and removed once
// it has been reconciled. Whatever is still in the journal at startup was
// accepted but never finished, and gets resubmitted in id order.
//
// ============================================================================

/// An accepted event waiting for reconciliation.
///
/// Ids are UUIDv7, so sorting by id gives acceptance order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub id: Uuid,
    pub accepted_at: DateTime<Utc>,
    pub event: OrderStatusEvent,
}

impl QueuedEvent {
    pub fn new(event: OrderStatusEvent) -> Self {
        Self {
            id: Uuid::now_v7(),
            accepted_at: Utc::now(),
            event,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JournalError {
    #[error("Journal write failed: {0}")]
    Write(String),

    #[error("Journal read failed: {0}")]
    Read(String),

    #[error("Journal entry {id} could not be decoded: {reason}")]
    Decode { id: Uuid, reason: String },
}

#[async_trait]
pub trait EventJournal: Send + Sync {
    async fn append(&self, entry: &QueuedEvent) -> Result<(), JournalError>;

    async fn acknowledge(&self, id: Uuid) -> Result<(), JournalError>;

    /// Unacknowledged entries, oldest first
    async fn pending(&self) -> Result<Vec<QueuedEvent>, JournalError>;
}

// ============================================================================
// In-memory journal
// ============================================================================

#[derive(Default)]
pub struct InMemoryJournal {
    entries: Mutex<BTreeMap<Uuid, QueuedEvent>>,
    fail_appends: AtomicBool,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append fail until switched back off
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl EventJournal for InMemoryJournal {
    async fn append(&self, entry: &QueuedEvent) -> Result<(), JournalError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(JournalError::Write("injected failure".to_string()));
        }
        self.entries.lock().await.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn acknowledge(&self, id: Uuid) -> Result<(), JournalError> {
        self.entries.lock().await.remove(&id);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<QueuedEvent>, JournalError> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }
}

// ============================================================================
// Scylla journal
// ============================================================================

const JOURNAL_PARTITION: &str = "pending";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS pending_events (
    bucket text,
    id uuid,
    accepted_at timestamp,
    payload text,
    PRIMARY KEY ((bucket), id)
) WITH CLUSTERING ORDER BY (id ASC)";

const INSERT_ENTRY: &str =
    "INSERT INTO pending_events (bucket, id, accepted_at, payload) VALUES (?, ?, ?, ?)";

const DELETE_ENTRY: &str = "DELETE FROM pending_events WHERE bucket = ? AND id = ?";

const SELECT_PENDING: &str = "SELECT id, accepted_at, payload FROM pending_events WHERE bucket = ?";

pub struct ScyllaJournal {
    session: Arc<Session>,
}

impl ScyllaJournal {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        self.session.query_unpaged(CREATE_TABLE, &[]).await?;
        tracing::info!("pending_events table ready");
        Ok(())
    }
}

#[async_trait]
impl EventJournal for ScyllaJournal {
    async fn append(&self, entry: &QueuedEvent) -> Result<(), JournalError> {
        let payload = serde_json::to_string(&entry.event).map_err(|e| JournalError::Write(e.to_string()))?;

        self.session
            .query_unpaged(INSERT_ENTRY, (JOURNAL_PARTITION, entry.id, entry.accepted_at, payload))
            .await
            .map_err(|e| JournalError::Write(e.to_string()))?;
        Ok(())
    }

    async fn acknowledge(&self, id: Uuid) -> Result<(), JournalError> {
        self.session
            .query_unpaged(DELETE_ENTRY, (JOURNAL_PARTITION, id))
            .await
            .map_err(|e| JournalError::Write(e.to_string()))?;
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<QueuedEvent>, JournalError> {
        let rows: Vec<(Uuid, DateTime<Utc>, String)> = self
            .session
            .query_iter(SELECT_PENDING, (JOURNAL_PARTITION,))
            .await
            .map_err(|e| JournalError::Read(e.to_string()))?
            .rows_stream::<(Uuid, DateTime<Utc>, String)>()
            .map_err(|e| JournalError::Read(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| JournalError::Read(e.to_string()))?;

        let mut entries = rows
            .into_iter()
            .map(|(id, accepted_at, payload)| decode_entry(id, accepted_at, &payload))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.id);
        Ok(entries)
    }
}

fn decode_entry(id: Uuid, accepted_at: DateTime<Utc>, payload: &str) -> Result<QueuedEvent, JournalError> {
    let event = serde_json::from_str(payload).map_err(|e| JournalError::Decode {
        id,
        reason: e.to_string(),
    })?;
    Ok(QueuedEvent { id, accepted_at, event })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{EventKind, Platform};

    fn event(order_id: &str) -> OrderStatusEvent {
        OrderStatusEvent {
            platform: Platform::MarketplaceB,
            platform_order_id: order_id.to_string(),
            seller_id: "1001".to_string(),
            new_status: "unpaid".to_string(),
            event_timestamp: 1_000,
            raw_payload_digest: format!("digest-{}", order_id),
            kind: EventKind::TradeOrder { order_line_id: None },
        }
    }

    #[tokio::test]
    async fn test_pending_returns_unacknowledged_in_acceptance_order() {
        let journal = InMemoryJournal::new();
        let first = QueuedEvent::new(event("T1"));
        let second = QueuedEvent::new(event("T2"));
        let third = QueuedEvent::new(event("T3"));

        journal.append(&third).await.unwrap();
        journal.append(&first).await.unwrap();
        journal.append(&second).await.unwrap();
        journal.acknowledge(second.id).await.unwrap();

        let pending = journal.pending().await.unwrap();
        assert_eq!(pending, vec![first, third]);
    }

    #[tokio::test]
    async fn test_append_failure_is_reported() {
        let journal = InMemoryJournal::new();
        journal.fail_appends(true);

        let result = journal.append(&QueuedEvent::new(event("T1"))).await;

        assert!(matches!(result, Err(JournalError::Write(_))));
        assert!(journal.is_empty().await);
    }

    #[test]
    fn test_decode_entry_round_trips_payload() {
        let entry = QueuedEvent::new(event("T9"));
        let payload = serde_json::to_string(&entry.event).unwrap();

        let decoded = decode_entry(entry.id, entry.accepted_at, &payload).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_decode_entry_rejects_garbage() {
        let result = decode_entry(Uuid::now_v7(), Utc::now(), "{not json");
        assert!(matches!(result, Err(JournalError::Decode { .. })));
    }
}
