use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::domain::order::{EventKind, OrderStatusEvent, Platform};

// ============================================================================
// Payload Normalizer
// ============================================================================
//
// One function per platform, each producing the same canonical
// `OrderStatusEvent`. Field aliasing and sub-event discrimination are
// resolved here and nowhere else.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationErrorKind {
    Malformed,
    MissingRequiredField,
    UnsupportedEvent,
}

impl fmt::Display for NormalizationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NormalizationErrorKind::Malformed => "MALFORMED",
            NormalizationErrorKind::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            NormalizationErrorKind::UnsupportedEvent => "UNSUPPORTED_EVENT",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct NormalizationError {
    pub kind: NormalizationErrorKind,
    pub message: String,
}

impl NormalizationError {
    fn malformed(message: impl Into<String>) -> Self {
        Self { kind: NormalizationErrorKind::Malformed, message: message.into() }
    }

    fn missing(field: &str) -> Self {
        Self {
            kind: NormalizationErrorKind::MissingRequiredField,
            message: format!("missing required field `{}`", field),
        }
    }

    fn unsupported(message: impl Into<String>) -> Self {
        Self { kind: NormalizationErrorKind::UnsupportedEvent, message: message.into() }
    }
}

/// Lowercase hex SHA-256 of the raw body, used for duplicate detection
pub fn payload_digest(raw_body: &[u8]) -> String {
    hex::encode(Sha256::digest(raw_body))
}

// ============================================================================
// Wire Shapes
// ============================================================================

/// Identifiers and timestamps arrive as strings on some platforms and
/// numbers on others.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
}

impl Scalar {
    /// Blank text counts as absent; a negative or fractional number is
    /// present but unusable.
    fn into_id(self, field: &str) -> Result<Option<String>, NormalizationError> {
        match self {
            Scalar::Text(s) => Ok(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
            Scalar::Int(n) if n >= 0 => Ok(Some(n.to_string())),
            Scalar::Float(f) if f.fract() == 0.0 && f >= 0.0 => Ok(Some(format!("{:.0}", f))),
            Scalar::Int(_) | Scalar::Float(_) => {
                Err(NormalizationError::malformed(format!("`{}` is not a valid identifier", field)))
            }
        }
    }

    fn into_millis(self, field: &str) -> Result<i64, NormalizationError> {
        let millis = match self {
            Scalar::Int(n) => Some(n),
            Scalar::Text(s) => s.trim().parse::<i64>().ok(),
            Scalar::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Some(f as i64),
            Scalar::Float(_) => None,
        };

        millis
            .filter(|ms| *ms >= 0 && DateTime::from_timestamp_millis(*ms).is_some())
            .ok_or_else(|| NormalizationError::malformed(format!("`{}` is not a valid epoch timestamp", field)))
    }
}

#[derive(Debug, Deserialize)]
struct MarketplaceAEnvelope {
    #[serde(alias = "shopId")]
    shop_id: Option<Scalar>,
    #[serde(rename = "type")]
    message_type: Option<i64>,
    #[serde(alias = "tts_notification_id")]
    notification_id: Option<String>,
    data: Option<MarketplaceAOrderStatus>,
}

#[derive(Debug, Deserialize)]
struct MarketplaceAOrderStatus {
    #[serde(alias = "orderId")]
    order_id: Option<Scalar>,
    #[serde(alias = "orderStatus")]
    order_status: Option<String>,
    #[serde(alias = "updateTime")]
    update_time: Option<Scalar>,
    #[serde(alias = "isOnHoldOrder")]
    is_on_hold_order: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct MarketplaceBEnvelope {
    #[serde(alias = "sellerId")]
    seller_id: Option<Scalar>,
    #[serde(alias = "messageType")]
    message_type: Option<i64>,
    data: Option<MarketplaceBOrderData>,
}

#[derive(Debug, Deserialize)]
struct MarketplaceBOrderData {
    #[serde(alias = "orderStatus")]
    order_status: Option<String>,
    #[serde(alias = "statusUpdateTime")]
    status_update_time: Option<Scalar>,
    #[serde(alias = "tradeOrderId")]
    trade_order_id: Option<Scalar>,
    #[serde(alias = "tradeOrderLineId")]
    trade_order_line_id: Option<Scalar>,
    #[serde(alias = "reverseOrderId")]
    reverse_order_id: Option<Scalar>,
    #[serde(alias = "reverseOrderLineId")]
    reverse_order_line_id: Option<Scalar>,
}

#[derive(Debug, Deserialize)]
struct MarketplaceCEnvelope {
    #[serde(alias = "shopId")]
    shop_id: Option<Scalar>,
    code: Option<i64>,
    data: Option<MarketplaceCOrderData>,
}

#[derive(Debug, Deserialize)]
struct MarketplaceCOrderData {
    #[serde(alias = "order_sn")]
    ordersn: Option<Scalar>,
    #[serde(alias = "order_status")]
    status: Option<String>,
    #[serde(alias = "updateTime")]
    update_time: Option<Scalar>,
    #[serde(alias = "completedScenario")]
    completed_scenario: Option<String>,
}

const MARKETPLACE_A_ORDER_STATUS: i64 = 1;
const MARKETPLACE_B_TRADE_ORDER: i64 = 0;
const MARKETPLACE_B_REVERSE_ORDER: i64 = 10;
const MARKETPLACE_C_ORDER_STATUS_PUSH: i64 = 3;

// ============================================================================
// Normalizer
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct PayloadNormalizer;

impl PayloadNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, platform: Platform, raw_body: &[u8]) -> Result<OrderStatusEvent, NormalizationError> {
        let digest = payload_digest(raw_body);

        let event = match platform {
            Platform::MarketplaceA => normalize_marketplace_a(parse(raw_body)?, digest)?,
            Platform::MarketplaceB => normalize_marketplace_b(parse(raw_body)?, digest)?,
            Platform::MarketplaceC => normalize_marketplace_c(parse(raw_body)?, digest)?,
        };

        tracing::debug!(
            platform = %platform,
            platform_order_id = %event.platform_order_id,
            kind = event.kind.label(),
            event_timestamp = event.event_timestamp,
            "Normalized webhook payload"
        );

        Ok(event)
    }
}

fn parse<T: DeserializeOwned>(raw_body: &[u8]) -> Result<T, NormalizationError> {
    serde_json::from_slice(raw_body)
        .map_err(|e| NormalizationError::malformed(format!("invalid JSON payload: {}", e)))
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, NormalizationError> {
    value.ok_or_else(|| NormalizationError::missing(field))
}

fn optional_id(value: Option<Scalar>, field: &str) -> Result<Option<String>, NormalizationError> {
    Ok(value.map(|v| v.into_id(field)).transpose()?.flatten())
}

fn required_id(value: Option<Scalar>, field: &str) -> Result<String, NormalizationError> {
    required(optional_id(value, field)?, field)
}

fn required_status(value: Option<String>, field: &str) -> Result<String, NormalizationError> {
    required(value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()), field)
}

fn seller(value: Option<Scalar>, field: &str) -> Result<String, NormalizationError> {
    Ok(optional_id(value, field)?.unwrap_or_default())
}

fn normalize_marketplace_a(
    envelope: MarketplaceAEnvelope,
    digest: String,
) -> Result<OrderStatusEvent, NormalizationError> {
    match required(envelope.message_type, "type")? {
        MARKETPLACE_A_ORDER_STATUS => {}
        other => return Err(NormalizationError::unsupported(format!("message type {}", other))),
    }

    let data = required(envelope.data, "data")?;

    tracing::trace!(notification_id = ?envelope.notification_id, "Marketplace A order status notification");

    Ok(OrderStatusEvent {
        platform: Platform::MarketplaceA,
        platform_order_id: required_id(data.order_id, "data.order_id")?,
        seller_id: seller(envelope.shop_id, "shop_id")?,
        new_status: required_status(data.order_status, "data.order_status")?,
        event_timestamp: required(data.update_time, "data.update_time")?.into_millis("data.update_time")?,
        raw_payload_digest: digest,
        kind: EventKind::OrderStatus {
            on_hold: data.is_on_hold_order,
            completed_scenario: None,
        },
    })
}

fn normalize_marketplace_b(
    envelope: MarketplaceBEnvelope,
    digest: String,
) -> Result<OrderStatusEvent, NormalizationError> {
    let data = required(envelope.data, "data")?;
    let reverse_order_id = optional_id(data.reverse_order_id, "data.reverse_order_id")?;

    // The discriminator is the presence of `reverse_order_id`; message_type
    // only has to agree with it.
    match (envelope.message_type, &reverse_order_id) {
        (None, _) | (Some(MARKETPLACE_B_TRADE_ORDER), _) | (Some(MARKETPLACE_B_REVERSE_ORDER), Some(_)) => {}
        (Some(MARKETPLACE_B_REVERSE_ORDER), None) => {
            return Err(NormalizationError::missing("data.reverse_order_id"))
        }
        (Some(other), _) => {
            return Err(NormalizationError::unsupported(format!("message type {}", other)))
        }
    }

    let trade_order_id = required_id(data.trade_order_id, "data.trade_order_id")?;
    let new_status = required_status(data.order_status, "data.order_status")?;
    let event_timestamp = required(data.status_update_time, "data.status_update_time")?
        .into_millis("data.status_update_time")?;

    let (platform_order_id, kind) = match reverse_order_id {
        Some(reverse_order_id) => (
            reverse_order_id,
            EventKind::ReverseOrder {
                trade_order_id,
                reverse_order_line_id: optional_id(data.reverse_order_line_id, "data.reverse_order_line_id")?,
            },
        ),
        None => (
            trade_order_id,
            EventKind::TradeOrder {
                order_line_id: optional_id(data.trade_order_line_id, "data.trade_order_line_id")?,
            },
        ),
    };

    Ok(OrderStatusEvent {
        platform: Platform::MarketplaceB,
        platform_order_id,
        seller_id: seller(envelope.seller_id, "seller_id")?,
        new_status,
        event_timestamp,
        raw_payload_digest: digest,
        kind,
    })
}

fn normalize_marketplace_c(
    envelope: MarketplaceCEnvelope,
    digest: String,
) -> Result<OrderStatusEvent, NormalizationError> {
    match required(envelope.code, "code")? {
        MARKETPLACE_C_ORDER_STATUS_PUSH => {}
        other => return Err(NormalizationError::unsupported(format!("push code {}", other))),
    }

    let data = required(envelope.data, "data")?;

    Ok(OrderStatusEvent {
        platform: Platform::MarketplaceC,
        platform_order_id: required_id(data.ordersn, "data.ordersn")?,
        seller_id: seller(envelope.shop_id, "shop_id")?,
        new_status: required_status(data.status, "data.status")?,
        event_timestamp: required(data.update_time, "data.update_time")?.into_millis("data.update_time")?,
        raw_payload_digest: digest,
        kind: EventKind::OrderStatus {
            on_hold: None,
            completed_scenario: data.completed_scenario.filter(|s| !s.trim().is_empty()),
        },
    })
}

// ============================================================================
// Unit Tests
// ============================================================================
