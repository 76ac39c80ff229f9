// ============================================================================
// Domain Layer
// ============================================================================
//
// Marketplace-agnostic order model. Platform wire shapes never reach this
// layer; see `webhook::normalizer`.
//
// ============================================================================

pub mod order;
