//! Orchestration run records and the store that owns them.

mod run;
mod store;

pub use run::{
    GateState, GateTransition, LogEntry, LogLevel, OrchestrationContext, OrchestrationReport,
    OrchestrationStatus, PendingBypass, PendingEscalation,
};
pub use store::{ContextStore, SharedContext};
