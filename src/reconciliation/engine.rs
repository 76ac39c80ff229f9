use chrono::Utc;
use std::fmt;
use std::sync::Arc;

use crate::domain::order::{Assessment, Order, OrderError, OrderStatusEvent};
use crate::store::{OrderStore, StoreError};
use crate::utils::IsTransient;

// ============================================================================
// Reconciliation Engine
// ============================================================================
//
// 1. Read the current order for the event's key
// 2. Absent  -> create from the event
//    Present -> apply only if the event is strictly newer by source time;
//               duplicates (same digest) and stale events are no-ops
// 3. Write with compare-and-swap on the `updated_at` read in step 1
// 4. On conflict, start over from step 1 (bounded)
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Created,
    Updated,
    Stale,
    Duplicate,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Created => "created",
            Disposition::Updated => "updated",
            Disposition::Stale => "stale",
            Disposition::Duplicate => "duplicate",
        }
    }

    /// Whether this outcome wrote to the store
    pub fn mutated(&self) -> bool {
        matches!(self, Disposition::Created | Disposition::Updated)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub order: Order,
    pub disposition: Disposition,
    pub attempts: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconciliationError {
    #[error("Transient store failure: {0}")]
    StoreTransient(String),

    #[error("Order {key} still conflicting after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },

    #[error("Store failure: {0}")]
    Store(String),

    #[error(transparent)]
    Order(#[from] OrderError),
}

impl IsTransient for ReconciliationError {
    fn is_transient(&self) -> bool {
        matches!(self, ReconciliationError::StoreTransient(_))
    }
}

impl From<StoreError> for ReconciliationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(msg) => ReconciliationError::StoreTransient(msg),
            StoreError::Conflict { key } => ReconciliationError::Conflict { key, attempts: 1 },
            StoreError::Permanent(msg) => ReconciliationError::Store(msg),
        }
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn OrderStore>,
    max_conflict_retries: u32,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn OrderStore>, max_conflict_retries: u32) -> Self {
        Self { store, max_conflict_retries }
    }

    pub async fn reconcile(&self, event: &OrderStatusEvent) -> Result<Reconciled, ReconciliationError> {
        let key = event.key();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let (candidate, expected, disposition) = match self.store.find_by_key(&key).await? {
                None => (Order::from_event(event, Utc::now())?, None, Disposition::Created),
                Some(existing) => match existing.assess(event)? {
                    Assessment::Apply => {
                        let expected = existing.updated_at;
                        (existing.applied(event)?, Some(expected), Disposition::Updated)
                    }
                    Assessment::Duplicate => {
                        tracing::debug!(key = %key, digest = %event.raw_payload_digest, "Duplicate event, nothing to apply");
                        return Ok(Reconciled { order: existing, disposition: Disposition::Duplicate, attempts });
                    }
                    Assessment::Stale => {
                        tracing::debug!(
                            key = %key,
                            event_timestamp = event.event_timestamp,
                            stored_updated_at = %existing.updated_at,
                            "Stale event, keeping stored state"
                        );
                        return Ok(Reconciled { order: existing, disposition: Disposition::Stale, attempts });
                    }
                },
            };

            match self.store.create_or_update(candidate, expected).await {
                Ok(order) => {
                    tracing::info!(
                        key = %key,
                        status = %order.status,
                        disposition = %disposition,
                        attempts = attempts,
                        "✅ Order reconciled"
                    );
                    return Ok(Reconciled { order, disposition, attempts });
                }
                Err(StoreError::Conflict { .. }) if attempts <= self.max_conflict_retries => {
                    tracing::debug!(key = %key, attempt = attempts, "Concurrent write detected, re-reading order");
                }
                Err(StoreError::Conflict { key }) => {
                    tracing::warn!(key = %key, attempts = attempts, "Conflict retries exhausted");
                    return Err(ReconciliationError::Conflict { key, attempts });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
