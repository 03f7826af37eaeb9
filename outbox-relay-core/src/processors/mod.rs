//! Long-running processors of the relay.
//!
//! - `RelayEngine`: polls the outbox and dispatches events to the workflow
//! - `ClaimProcessCommit`: relays one event inside one store transaction
//! - `OutboxGc`: deletes processed rows on a fixed interval

pub mod outbox_gc;
pub mod relay;
pub mod workflow;

pub use outbox_gc::{GcState, OutboxGc, SweepOutcome};
pub use relay::{InFlight, RelayEngine};
pub use workflow::{ClaimProcessCommit, WorkflowError, WorkflowOutcome};
