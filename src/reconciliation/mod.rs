// ============================================================================
// Reconciliation
// ============================================================================
//
// Folds canonical events into Order aggregates held by the OrderStore.
// Stateless between invocations: every cycle re-reads the stored order.
//
// ============================================================================

mod engine;

pub use engine::{Disposition, Reconciled, ReconciliationEngine, ReconciliationError};
