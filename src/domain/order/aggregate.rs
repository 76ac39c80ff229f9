use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::OrderError;
use super::events::OrderStatusEvent;
use super::value_objects::{OrderKey, OrderKind, Platform};

// ============================================================================
// Order Aggregate - Canonical marketplace order
// ============================================================================
//
// Status values are platform-defined strings stored verbatim; there is no
// transition table. The only rule is temporal: `updated_at` (the source
// reported time of the last applied event) never regresses.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    // Identity
    pub id: Uuid,
    pub seller_id: String,
    pub platform_order_id: String,
    pub platform: Platform,
    pub kind: OrderKind,
    pub parent_order_id: Option<String>,

    // Current State
    pub status: String,
    pub order_date: Option<DateTime<Utc>>,
    pub package_ids: Vec<String>,

    // Audit Trail
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_event_digest: Option<String>,
}

/// What an incoming event would do to the stored order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    Apply,
    /// Event timestamp is not newer than the stored state
    Stale,
    /// Same payload digest as the last applied event
    Duplicate,
}

impl Order {
    /// Build a brand new aggregate from the first event seen for its key
    pub fn from_event(event: &OrderStatusEvent, now: DateTime<Utc>) -> Result<Self, OrderError> {
        let updated_at = event.event_time()?;

        Ok(Self {
            id: Uuid::new_v4(),
            seller_id: event.seller_id.clone(),
            platform_order_id: event.platform_order_id.clone(),
            platform: event.platform,
            kind: event.kind.order_kind(),
            parent_order_id: event.kind.parent_order_id().map(str::to_string),
            status: event.new_status.clone(),
            order_date: None,
            package_ids: Vec::new(),
            created_at: now,
            updated_at,
            last_event_digest: Some(event.raw_payload_digest.clone()),
        })
    }

    pub fn key(&self) -> OrderKey {
        OrderKey::new(self.platform, self.platform_order_id.clone(), self.seller_id.clone())
    }

    pub fn assess(&self, event: &OrderStatusEvent) -> Result<Assessment, OrderError> {
        if self.last_event_digest.as_deref() == Some(event.raw_payload_digest.as_str()) {
            return Ok(Assessment::Duplicate);
        }

        if event.event_time()? <= self.updated_at {
            return Ok(Assessment::Stale);
        }

        Ok(Assessment::Apply)
    }

    /// Fold an event into a copy of this order. Callers must have assessed
    /// the event as `Apply`; the returned order never regresses `updated_at`.
    pub fn applied(&self, event: &OrderStatusEvent) -> Result<Self, OrderError> {
        if event.key() != self.key() {
            return Err(OrderError::KeyMismatch {
                event_key: event.key().to_string(),
                order_key: self.key().to_string(),
            });
        }

        let event_time = event.event_time()?;
        let mut next = self.clone();
        next.status = event.new_status.clone();
        next.updated_at = next.updated_at.max(event_time);
        next.last_event_digest = Some(event.raw_payload_digest.clone());
        if next.parent_order_id.is_none() {
            next.parent_order_id = event.kind.parent_order_id().map(str::to_string);
        }

        Ok(next)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::EventKind;

    fn event(status: &str, ts: i64, digest: &str) -> OrderStatusEvent {
        OrderStatusEvent {
            platform: Platform::MarketplaceA,
            platform_order_id: "T1".to_string(),
            seller_id: "shop-1".to_string(),
            new_status: status.to_string(),
            event_timestamp: ts,
            raw_payload_digest: digest.to_string(),
            kind: EventKind::order_status(),
        }
    }

    #[test]
    fn test_from_event_uses_source_time_for_updated_at() {
        let now = Utc::now();
        let order = Order::from_event(&event("shipped", 1000, "d1"), now).unwrap();

        assert_eq!(order.status, "shipped");
        assert_eq!(order.updated_at.timestamp_millis(), 1000);
        assert_eq!(order.created_at, now);
        assert_eq!(order.kind, OrderKind::Trade);
        assert!(order.package_ids.is_empty());
        assert_eq!(order.last_event_digest.as_deref(), Some("d1"));
    }

    #[test]
    fn test_assess_newer_event_applies() {
        let order = Order::from_event(&event("shipped", 1000, "d1"), Utc::now()).unwrap();
        assert_eq!(order.assess(&event("delivered", 2000, "d2")).unwrap(), Assessment::Apply);
    }

    #[test]
    fn test_assess_older_and_equal_events_are_stale() {
        let order = Order::from_event(&event("delivered", 2000, "d2"), Utc::now()).unwrap();

        assert_eq!(order.assess(&event("shipped", 1000, "d1")).unwrap(), Assessment::Stale);
        assert_eq!(order.assess(&event("other", 2000, "d3")).unwrap(), Assessment::Stale);
    }

    #[test]
    fn test_assess_same_digest_is_duplicate() {
        let order = Order::from_event(&event("shipped", 1000, "d1"), Utc::now()).unwrap();
        assert_eq!(order.assess(&event("shipped", 1000, "d1")).unwrap(), Assessment::Duplicate);
    }

    #[test]
    fn test_applied_keeps_identity_and_advances_clock() {
        let order = Order::from_event(&event("shipped", 1000, "d1"), Utc::now()).unwrap();
        let next = order.applied(&event("delivered", 2000, "d2")).unwrap();

        assert_eq!(next.id, order.id);
        assert_eq!(next.created_at, order.created_at);
        assert_eq!(next.status, "delivered");
        assert_eq!(next.updated_at.timestamp_millis(), 2000);
        assert_eq!(next.last_event_digest.as_deref(), Some("d2"));
    }

    #[test]
    fn test_applied_rejects_foreign_key() {
        let order = Order::from_event(&event("shipped", 1000, "d1"), Utc::now()).unwrap();
        let mut other = event("delivered", 2000, "d2");
        other.platform_order_id = "T2".to_string();

        assert!(matches!(order.applied(&other), Err(OrderError::KeyMismatch { .. })));
    }
}
