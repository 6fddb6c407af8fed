//! Conflict detection and the reconciliation loop

mod conflict;
mod processor;


pub use conflict::detect_conflicts;
pub use processor::{ChangeNotifier, EventProcessor, ProcessorConfig, ReconcileOutcome};
