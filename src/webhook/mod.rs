// ============================================================================
// Webhook Boundary
// ============================================================================
//
// inbound webhook -> SignatureVerifier -> PayloadNormalizer -> EventDispatcher
//
// Everything platform-specific (auth schemes, wire shapes, field aliases)
// lives in this module. Downstream code only sees `OrderStatusEvent`.
//
// ============================================================================

mod gateway;
mod normalizer;
mod signature;

use std::collections::HashMap;

pub use gateway::{Accepted, WebhookError, WebhookGateway};
pub use normalizer::{payload_digest, NormalizationError, NormalizationErrorKind, PayloadNormalizer};
pub use signature::SignatureVerifier;

pub type Headers = HashMap<String, String>;

/// Case-insensitive header lookup
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
