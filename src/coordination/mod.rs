//! Coordination of deposit intents across destination chains
//!
//! The orchestrator:
//! 1. Creates one intent per deposit event, idempotently
//! 2. Commits the QUEUED transition before any chain work starts
//! 3. Fans out one supervised worker per destination chain
//! 4. Merges every chain report back through the store

pub mod engine;
pub mod supervisor;

pub use engine::{to_token_units, DispersalOrchestrator};
pub use supervisor::{TaskRecord, TaskStage, TaskSupervisor};
