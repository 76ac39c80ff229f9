use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use scylla::value::{CqlValue, Row};
use std::sync::Arc;
use uuid::Uuid;

use super::{OrderStore, StoreError};
use crate::domain::order::{Order, OrderKey, OrderKind};

// ============================================================================
// Scylla Order Store
// ============================================================================
//
// One row per marketplace order, partitioned by the uniqueness key.
// Writes are lightweight transactions:
// - create: INSERT ... IF NOT EXISTS
// - update: UPDATE ... IF updated_at = ?
// so racing writers for the same key are serialized by the cluster.
//
// ============================================================================

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS marketplace_orders (
    platform text,
    platform_order_id text,
    seller_id text,
    id uuid,
    kind text,
    parent_order_id text,
    status text,
    order_date timestamp,
    package_ids list<text>,
    created_at timestamp,
    updated_at timestamp,
    last_event_digest text,
    PRIMARY KEY ((platform, platform_order_id, seller_id))
)";

const SELECT_ORDER: &str = "SELECT id, kind, parent_order_id, status, order_date, package_ids,
        created_at, updated_at, last_event_digest
 FROM marketplace_orders
 WHERE platform = ? AND platform_order_id = ? AND seller_id = ?";

const INSERT_ORDER: &str = "INSERT INTO marketplace_orders (
    platform, platform_order_id, seller_id, id, kind, parent_order_id, status,
    order_date, package_ids, created_at, updated_at, last_event_digest
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS";

const UPDATE_ORDER: &str = "UPDATE marketplace_orders
 SET status = ?, parent_order_id = ?, order_date = ?, package_ids = ?,
     updated_at = ?, last_event_digest = ?
 WHERE platform = ? AND platform_order_id = ? AND seller_id = ?
 IF updated_at = ?";

type OrderRow = (
    Uuid,
    String,
    Option<String>,
    String,
    Option<DateTime<Utc>>,
    Option<Vec<String>>,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<String>,
);

pub struct ScyllaOrderStore {
    session: Arc<Session>,
}

impl ScyllaOrderStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        self.session.query_unpaged(CREATE_TABLE, &[]).await?;
        tracing::info!("marketplace_orders table ready");
        Ok(())
    }

    async fn insert(&self, order: &Order) -> Result<bool, StoreError> {
        let result = self
            .session
            .query_unpaged(
                INSERT_ORDER,
                (
                    order.platform.as_str(),
                    &order.platform_order_id,
                    &order.seller_id,
                    order.id,
                    order.kind.as_str(),
                    &order.parent_order_id,
                    &order.status,
                    order.order_date,
                    &order.package_ids,
                    order.created_at,
                    order.updated_at,
                    &order.last_event_digest,
                ),
            )
            .await
            .map_err(transient)?;

        let row = result
            .into_rows_result()
            .map_err(permanent)?
            .maybe_first_row::<Row>()
            .map_err(permanent)?;
        lwt_applied(row.as_ref())
    }

    async fn update(&self, order: &Order, expected: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = self
            .session
            .query_unpaged(
                UPDATE_ORDER,
                (
                    &order.status,
                    &order.parent_order_id,
                    order.order_date,
                    &order.package_ids,
                    order.updated_at,
                    &order.last_event_digest,
                    order.platform.as_str(),
                    &order.platform_order_id,
                    &order.seller_id,
                    expected,
                ),
            )
            .await
            .map_err(transient)?;

        let row = result
            .into_rows_result()
            .map_err(permanent)?
            .maybe_first_row::<Row>()
            .map_err(permanent)?;
        lwt_applied(row.as_ref())
    }
}

#[async_trait]
impl OrderStore for ScyllaOrderStore {
    async fn find_by_key(&self, key: &OrderKey) -> Result<Option<Order>, StoreError> {
        let result = self
            .session
            .query_unpaged(
                SELECT_ORDER,
                (key.platform.as_str(), &key.platform_order_id, &key.seller_id),
            )
            .await
            .map_err(transient)?;

        let row = result
            .into_rows_result()
            .map_err(permanent)?
            .maybe_first_row::<OrderRow>()
            .map_err(permanent)?;

        row.map(|row| order_from_row(key, row)).transpose()
    }

    async fn create_or_update(
        &self,
        order: Order,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Order, StoreError> {
        let applied = match expected_updated_at {
            None => self.insert(&order).await?,
            Some(expected) => self.update(&order, expected).await?,
        };

        if !applied {
            tracing::debug!(key = %order.key(), "Lightweight transaction not applied");
            return Err(StoreError::Conflict { key: order.key().to_string() });
        }

        Ok(order)
    }
}

fn order_from_row(key: &OrderKey, row: OrderRow) -> Result<Order, StoreError> {
    let (id, kind, parent_order_id, status, order_date, package_ids, created_at, updated_at, last_event_digest) = row;

    Ok(Order {
        id,
        seller_id: key.seller_id.clone(),
        platform_order_id: key.platform_order_id.clone(),
        platform: key.platform,
        kind: kind.parse::<OrderKind>().map_err(StoreError::Permanent)?,
        parent_order_id,
        status,
        order_date,
        package_ids: package_ids.unwrap_or_default(),
        created_at,
        updated_at,
        last_event_digest,
    })
}

/// First column of an LWT response is the `[applied]` flag
fn lwt_applied(row: Option<&Row>) -> Result<bool, StoreError> {
    match row.and_then(|r| r.columns.first()) {
        Some(Some(CqlValue::Boolean(applied))) => Ok(*applied),
        other => Err(StoreError::Permanent(format!(
            "Unexpected lightweight transaction response: {:?}",
            other
        ))),
    }
}

fn transient(e: impl std::fmt::Display) -> StoreError {
    StoreError::Transient(e.to_string())
}

fn permanent(e: impl std::fmt::Display) -> StoreError {
    StoreError::Permanent(e.to_string())
}
