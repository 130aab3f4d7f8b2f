//! Error taxonomy for quality gate orchestration.

use super::gate::GateType;
use super::tier::RepositoryTier;

/// A malformed validation request. The run is never created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("repository must not be empty")]
    MissingRepository,

    #[error("commit sha must not be empty")]
    MissingCommit,

    #[error("repository tier is required")]
    MissingTier,

    #[error("unknown repository tier: {0}")]
    UnknownTier(String),

    #[error("unknown gate type: {0}")]
    UnknownGateType(String),

    #[error("gate {0} has no validation phase")]
    UnplannableGate(GateType),

    #[error("required gate set is empty")]
    EmptyGateSet,

    #[error("gate {gate} is not required by the {tier} tier")]
    GateNotInTier { gate: GateType, tier: RepositoryTier },

    #[error("gate {gate} is mandatory for the {tier} tier and cannot be left out")]
    MandatoryGate { gate: GateType, tier: RepositoryTier },
}

/// An external collaborator call failed or did not answer in time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{operation} rejected: {message}")]
    Rejected { operation: String, message: String },

    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl CollaboratorError {
    pub fn rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// An update or command addressed a run that cannot accept it.
///
/// Gate updates that hit one of these are logged and discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("orchestration not found: {0}")]
    UnknownOrchestration(String),

    #[error("no orchestration for {repository}@{commit}")]
    UnknownCommit { repository: String, commit: String },

    #[error("orchestration {id} already {status}")]
    Terminal { id: String, status: String },

    #[error("gate {gate} is not part of orchestration {id}")]
    UnknownGate { id: String, gate: GateType },

    #[error("gate {gate} already settled in orchestration {id}")]
    GateSettled { id: String, gate: GateType },

    #[error("stale update for gate {gate} in orchestration {id}")]
    StaleUpdate { id: String, gate: GateType },

    #[error("orchestration already exists: {0}")]
    Duplicate(String),
}

/// A human decision (bypass approval, escalation outcome) was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error("{actor} is not authorized to {action}")]
    Unauthorized { actor: String, action: String },

    #[error("mandatory audit field missing: {0}")]
    MissingAuditField(&'static str),

    #[error("no bypass pending for gate {0}")]
    NoPendingBypass(GateType),

    #[error("no escalation pending for gate {0}")]
    NoPendingEscalation(GateType),
}

/// Top-level error surfaced by the orchestrator API.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("decision error: {0}")]
    Decision(#[from] DecisionError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::UnknownGateType("smoke".to_string());
        assert!(err.to_string().contains("smoke"));
        assert_eq!(
            ValidationError::UnplannableGate(GateType::Dor).to_string(),
            "gate dor has no validation phase"
        );
    }

    #[test]
    fn test_collaborator_timeout_display() {
        let err = CollaboratorError::Timeout {
            operation: "workflow trigger".to_string(),
            timeout_secs: 30,
        };
        let msg = err.to_string();
        assert!(msg.contains("workflow trigger"));
        assert!(msg.contains("30s"));
    }

    #[test]
    fn test_orchestration_error_wraps_sources() {
        let err: OrchestrationError = ValidationError::MissingTier.into();
        assert!(err.to_string().contains("tier is required"));

        let err: OrchestrationError = StateError::Terminal {
            id: "orch-1".to_string(),
            status: "completed".to_string(),
        }
        .into();
        assert!(err.to_string().contains("orch-1"));
    }
}
