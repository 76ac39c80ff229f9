use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::{OrderStore, StoreError};
use crate::domain::order::{Order, OrderKey};

/// In-process store backed by a `HashMap`.
///
/// Check-and-write happens under one write lock, which gives the same
/// insert-if-absent / compare-and-swap semantics as the Scylla adapter.
#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderKey, Order>>,
    writes: AtomicU64,
    fail_next: AtomicU32,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a transient error
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes since creation
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Order> {
        self.orders.read().await.values().cloned().collect()
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        let taken = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Transient("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn find_by_key(&self, key: &OrderKey) -> Result<Option<Order>, StoreError> {
        self.injected_failure()?;
        Ok(self.orders.read().await.get(key).cloned())
    }

    async fn create_or_update(
        &self,
        order: Order,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Order, StoreError> {
        self.injected_failure()?;

        let key = order.key();
        let mut orders = self.orders.write().await;
        let current = orders.get(&key).map(|existing| existing.updated_at);

        if current != expected_updated_at {
            return Err(StoreError::Conflict { key: key.to_string() });
        }

        orders.insert(key, order.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(order)
    }
}
