// ============================================================================
// Order Domain - Canonical marketplace order
// ============================================================================
//
// - Value objects (Platform, OrderKey, OrderKind)
// - Events (OrderStatusEvent, EventKind)
// - Errors (OrderError)
// - Aggregate (Order with the temporal ordering rule)
//
// ============================================================================

pub mod value_objects;
pub mod events;
pub mod errors;
pub mod aggregate;

pub use value_objects::*;
pub use events::*;
pub use errors::*;
pub use aggregate::*;
