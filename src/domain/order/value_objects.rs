use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Order Value Objects
// ============================================================================

/// Marketplace integration identity. Immutable tag on every order and event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    MarketplaceA,
    MarketplaceB,
    MarketplaceC,
}

impl Platform {
    pub const ALL: [Platform; 3] = [
        Platform::MarketplaceA,
        Platform::MarketplaceB,
        Platform::MarketplaceC,
    ];

    /// Stable storage / label representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::MarketplaceA => "MARKETPLACE_A",
            Platform::MarketplaceB => "MARKETPLACE_B",
            Platform::MarketplaceC => "MARKETPLACE_C",
        }
    }

    /// URL path segment used by the webhook routes
    pub fn slug(&self) -> &'static str {
        match self {
            Platform::MarketplaceA => "marketplace-a",
            Platform::MarketplaceB => "marketplace-b",
            Platform::MarketplaceC => "marketplace-c",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s) || p.slug().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

/// Uniqueness key of an Order aggregate: at most one aggregate per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub platform: Platform,
    pub platform_order_id: String,
    pub seller_id: String,
}

impl OrderKey {
    pub fn new(
        platform: Platform,
        platform_order_id: impl Into<String>,
        seller_id: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            platform_order_id: platform_order_id.into(),
            seller_id: seller_id.into(),
        }
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.platform, self.seller_id, self.platform_order_id)
    }
}

/// Trade orders and reverse (return) orders are reconciled as separate aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Trade,
    Reverse,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Trade => "trade",
            OrderKind::Reverse => "reverse",
        }
    }
}

impl FromStr for OrderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" => Ok(OrderKind::Trade),
            "reverse" => Ok(OrderKind::Reverse),
            other => Err(format!("Unknown order kind: {}", other)),
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parses_from_label_and_slug() {
        assert_eq!("MARKETPLACE_A".parse::<Platform>().unwrap(), Platform::MarketplaceA);
        assert_eq!("marketplace-b".parse::<Platform>().unwrap(), Platform::MarketplaceB);
        assert_eq!("Marketplace_C".parse::<Platform>().unwrap(), Platform::MarketplaceC);
        assert!("amazon".parse::<Platform>().is_err());
    }

    #[test]
    fn test_platform_serializes_as_screaming_snake() {
        let json = serde_json::to_string(&Platform::MarketplaceB).unwrap();
        assert_eq!(json, "\"MARKETPLACE_B\"");
    }

    #[test]
    fn test_order_key_equality_covers_all_parts() {
        let a = OrderKey::new(Platform::MarketplaceA, "T1", "seller-1");
        let b = OrderKey::new(Platform::MarketplaceA, "T1", "seller-2");
        let c = OrderKey::new(Platform::MarketplaceB, "T1", "seller-1");

        assert_eq!(a, OrderKey::new(Platform::MarketplaceA, "T1", "seller-1"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "MARKETPLACE_A/seller-1/T1");
    }
}
