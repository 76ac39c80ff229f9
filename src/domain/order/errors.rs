// ============================================================================
// Order Business Rule Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("Event timestamp {0} is outside the representable range")]
    TimestampOutOfRange(i64),

    #[error("Event for {event_key} cannot be applied to order {order_key}")]
    KeyMismatch { event_key: String, order_key: String },
}
