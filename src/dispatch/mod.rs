// ============================================================================
// Dispatch - durable, per-order ordered delivery to the reconciliation engine
// ============================================================================

mod dead_letter;
mod dispatcher;
mod journal;

pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use dispatcher::{DispatchError, DispatcherSnapshot, EventDispatcher, Undelivered};
pub use journal::{EventJournal, InMemoryJournal, JournalError, QueuedEvent, ScyllaJournal};
