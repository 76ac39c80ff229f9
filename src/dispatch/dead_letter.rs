use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::journal::QueuedEvent;

// ============================================================================
// Dead Letter Queue
// ============================================================================
//
// Holds events that could not be reconciled after all retry attempts.
// Provides:
// - Operator-visible listing (also summarised on /health)
// - Failure counting across replays
//
// A letter stays listed while its event is replayed and is only resolved
// once the event reconciles. The journal entry of a dead-lettered event is
// left in place, so the event survives a restart even if nobody replays it.
//
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub entry: QueuedEvent,
    pub error_message: String,
    pub failure_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct DeadLetterQueue {
    letters: Mutex<BTreeMap<Uuid, DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed event. A repeat failure of the same entry bumps its
    /// count instead of adding a second letter.
    pub async fn push(&self, entry: QueuedEvent, error_message: String) -> DeadLetter {
        let now = Utc::now();
        let mut letters = self.letters.lock().await;

        let letter = letters
            .entry(entry.id)
            .and_modify(|letter| {
                letter.failure_count += 1;
                letter.last_failed_at = now;
                letter.error_message = error_message.clone();
            })
            .or_insert_with(|| DeadLetter {
                entry,
                error_message,
                failure_count: 1,
                first_failed_at: now,
                last_failed_at: now,
            })
            .clone();

        tracing::error!(
            event_id = %letter.entry.id,
            key = %letter.entry.event.key(),
            error = %letter.error_message,
            failure_count = letter.failure_count,
            "💀 Adding event to Dead Letter Queue"
        );

        letter
    }

    /// Drop the letter for an event that has since reconciled
    pub async fn resolve(&self, id: Uuid) -> Option<DeadLetter> {
        self.letters.lock().await.remove(&id)
    }

    pub async fn list(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.letters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.letters.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{EventKind, OrderStatusEvent, Platform};

    fn queued(order_id: &str) -> QueuedEvent {
        QueuedEvent::new(OrderStatusEvent {
            platform: Platform::MarketplaceC,
            platform_order_id: order_id.to_string(),
            seller_id: String::new(),
            new_status: "READY_TO_SHIP".to_string(),
            event_timestamp: 5,
            raw_payload_digest: "d".to_string(),
            kind: EventKind::order_status(),
        })
    }

    #[tokio::test]
    async fn test_repeat_failure_increments_count() {
        let dlq = DeadLetterQueue::new();
        let entry = queued("SN1");

        dlq.push(entry.clone(), "timeout".to_string()).await;
        let letter = dlq.push(entry, "still timing out".to_string()).await;

        assert_eq!(dlq.len().await, 1);
        assert_eq!(letter.failure_count, 2);
        assert_eq!(letter.error_message, "still timing out");
        assert!(letter.last_failed_at >= letter.first_failed_at);
    }

    #[tokio::test]
    async fn test_list_is_in_event_order() {
        let dlq = DeadLetterQueue::new();
        let first = queued("SN1");
        let second = queued("SN2");

        dlq.push(second.clone(), "x".to_string()).await;
        dlq.push(first.clone(), "y".to_string()).await;

        let listed = dlq.list().await;
        assert_eq!(listed.iter().map(|l| l.entry.id).collect::<Vec<_>>(), vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_resolve_removes_only_that_letter() {
        let dlq = DeadLetterQueue::new();
        let first = queued("SN1");
        dlq.push(first.clone(), "x".to_string()).await;
        dlq.push(queued("SN2"), "y".to_string()).await;

        let resolved = dlq.resolve(first.id).await.unwrap();

        assert_eq!(resolved.entry.id, first.id);
        assert_eq!(dlq.len().await, 1);
        assert!(dlq.resolve(first.id).await.is_none());
    }
}
