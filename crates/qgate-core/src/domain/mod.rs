//! Domain model: tiers, gates, requests, outcomes and the error taxonomy.

pub mod error;
pub mod gate;
pub mod outcome;
pub mod request;
pub mod tier;

pub use error::{
    CollaboratorError, DecisionError, OrchestrationError, Result, StateError, ValidationError,
};
pub use gate::{CheckState, GateStatus, GateType, CHECK_PREFIX, COMPLIANCE_CHECK};
pub use outcome::{FailureCause, FailureRecord, GateOutcome, GateStatusUpdate, Severity};
pub use request::{DispatchPriority, ValidatedRequest, ValidationPriority, ValidationRequest};
pub use tier::RepositoryTier;
