use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::order::{Order, OrderKey};
use crate::utils::IsTransient;

// ============================================================================
// Order Store - Durable keyed storage for Order aggregates
// ============================================================================
//
// The store is the only shared mutable resource. Every write is a
// compare-and-swap on `updated_at`, so callers never need in-process locks.
//
// ============================================================================

mod in_memory;
mod scylla_order_store;

pub use in_memory::InMemoryOrderStore;
pub use scylla_order_store::ScyllaOrderStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A concurrent writer advanced (or created) the record first
    #[error("Concurrent modification of order {key}")]
    Conflict { key: String },

    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Store failure: {0}")]
    Permanent(String),
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_by_key(&self, key: &OrderKey) -> Result<Option<Order>, StoreError>;

    /// Persist `order`.
    ///
    /// `expected_updated_at = None` means "create": fails with `Conflict` if
    /// the key already exists. `Some(t)` means "update": fails with
    /// `Conflict` unless the stored `updated_at` still equals `t`.
    async fn create_or_update(
        &self,
        order: Order,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Order, StoreError>;
}
