//! qgate Core Library
//!
//! Tier-aware quality gate orchestration: plans validation phases for a
//! commit, drives an external CI workflow, projects gate results onto commit
//! status checks, resolves failures by tier policy and configures branch
//! protection once a verdict is reached.

pub mod collaborators;
pub mod config;
pub mod context;
pub mod decision;
pub mod domain;
pub mod events;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod plan;
pub mod policy;
pub mod resolver;
pub mod status;
pub mod telemetry;

pub use domain::{
    CheckState, CollaboratorError, DecisionError, FailureCause, FailureRecord, GateOutcome,
    GateStatus, GateStatusUpdate, GateType, OrchestrationError, RepositoryTier, Result, Severity,
    StateError, ValidatedRequest, ValidationError, ValidationPriority, ValidationRequest,
};

pub use collaborators::{
    BranchProtector, GateConfig, ProtectionRequest, StatusReporter, WorkflowDispatch,
    WorkflowRun, WorkflowRunStatus, WorkflowTrigger,
};
pub use config::{ConfigError, OrchestratorConfig};
pub use context::{OrchestrationReport, OrchestrationStatus};
pub use decision::{
    BypassApproval, BypassRejection, DecisionAuditRecord, DecisionKind, EscalationDecision,
    EscalationOutcome,
};
pub use events::{EventBus, EventEnvelope, OrchestrationEvent};
pub use metrics::METRICS;
pub use orchestrator::{Collaborators, Orchestrator, UpdateDisposition};
pub use plan::{PhaseKind, PlanBuilder, PlanError, ValidationPhase, ValidationPlan};
pub use policy::{PolicyTable, ReviewRequirements, TierPolicy};
pub use resolver::{FailureResolution, FailureResolver, ResolutionAction, Urgency};
pub use status::{CheckUpdate, ComplianceSummary, ComplianceVerdict, StatusProjector};
pub use telemetry::init_tracing;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
