use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::OrderError;
use super::value_objects::{OrderKey, OrderKind, Platform};

// ============================================================================
// Canonical Order Status Event
// ============================================================================
//
// Produced by the payload normalizer from one raw webhook body, consumed
// exactly once by the reconciliation engine. Never persisted on its own
// except as a journal entry awaiting processing.
//
// ============================================================================

/// Sub-event tag. Platform payloads that carry distinct event families are
/// never merged into one shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    OrderStatus {
        #[serde(default)]
        on_hold: Option<bool>,
        #[serde(default)]
        completed_scenario: Option<String>,
    },
    TradeOrder {
        order_line_id: Option<String>,
    },
    ReverseOrder {
        trade_order_id: String,
        reverse_order_line_id: Option<String>,
    },
}

impl EventKind {
    /// Plain status change with no platform extras
    pub fn order_status() -> Self {
        EventKind::OrderStatus { on_hold: None, completed_scenario: None }
    }

    pub fn order_kind(&self) -> OrderKind {
        match self {
            EventKind::ReverseOrder { .. } => OrderKind::Reverse,
            EventKind::OrderStatus { .. } | EventKind::TradeOrder { .. } => OrderKind::Trade,
        }
    }

    pub fn parent_order_id(&self) -> Option<&str> {
        match self {
            EventKind::ReverseOrder { trade_order_id, .. } => Some(trade_order_id),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EventKind::OrderStatus { .. } => "order_status",
            EventKind::TradeOrder { .. } => "trade_order",
            EventKind::ReverseOrder { .. } => "reverse_order",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusEvent {
    pub platform: Platform,
    pub platform_order_id: String,
    /// Empty when the source platform does not report a seller.
    pub seller_id: String,
    pub new_status: String,
    /// Epoch milliseconds as reported by the source platform.
    pub event_timestamp: i64,
    pub raw_payload_digest: String,
    pub kind: EventKind,
}

impl OrderStatusEvent {
    pub fn key(&self) -> OrderKey {
        OrderKey::new(self.platform, self.platform_order_id.clone(), self.seller_id.clone())
    }

    /// Source-reported time, authoritative for ordering
    pub fn event_time(&self) -> Result<DateTime<Utc>, OrderError> {
        DateTime::from_timestamp_millis(self.event_timestamp)
            .ok_or(OrderError::TimestampOutOfRange(self.event_timestamp))
    }
}
