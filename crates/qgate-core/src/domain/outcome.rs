//! Gate outcomes reported by validators, and the failure records derived from them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::gate::{GateStatus, GateType};
use super::tier::RepositoryTier;

/// One report about one gate. Several may arrive per gate; the last one wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: GateType,
    pub status: GateStatus,
    /// Optional 0-100 score from the validator.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub detail: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl GateOutcome {
    pub fn new(gate: GateType, status: GateStatus) -> Self {
        Self {
            gate,
            status,
            score: None,
            detail: String::new(),
            timestamp: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn success(gate: GateType) -> Self {
        Self::new(gate, GateStatus::Success)
    }

    pub fn failure(gate: GateType, detail: impl Into<String>) -> Self {
        Self::new(gate, GateStatus::Failure).with_detail(detail)
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score.clamp(0.0, 100.0));
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A gate outcome addressed to a run, as delivered by the external workflow.
///
/// The run is located by `orchestration_id` when present, otherwise by the
/// `(repository, commit)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateStatusUpdate {
    #[serde(default)]
    pub orchestration_id: Option<String>,
    pub repository: String,
    pub commit: String,
    #[serde(flatten)]
    pub outcome: GateOutcome,
}

impl GateStatusUpdate {
    pub fn new(
        repository: impl Into<String>,
        commit: impl Into<String>,
        outcome: GateOutcome,
    ) -> Self {
        Self {
            orchestration_id: None,
            repository: repository.into(),
            commit: commit.into(),
            outcome,
        }
    }

    pub fn for_orchestration(mut self, id: impl Into<String>) -> Self {
        self.orchestration_id = Some(id.into());
        self
    }
}

/// How bad a failure is. Only ever raises escalation urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn raised(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Severity of a failure on `gate` for a repository of `tier`.
    ///
    /// Security and compliance gates start at high, everything else at
    /// medium. Validator errors and mission-critical repositories each raise
    /// it one level; timeouts never raise it.
    pub fn classify(gate: GateType, cause: &FailureCause, tier: RepositoryTier) -> Self {
        let mut severity = match gate.canonical().unwrap_or(gate) {
            GateType::SecurityScan | GateType::SecurityReview | GateType::ComplianceAudit => {
                Self::High
            }
            GateType::DocumentationCheck => Self::Low,
            _ => Self::Medium,
        };
        if matches!(cause, FailureCause::Error { .. }) {
            severity = severity.raised();
        }
        if tier == RepositoryTier::MissionCritical && !matches!(cause, FailureCause::Timeout { .. })
        {
            severity = severity.raised();
        }
        severity
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Why a gate failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The validator ran and reported a failing result.
    Failed { detail: String },
    /// The validator itself errored.
    Error { detail: String },
    /// The gate's phase ran out of time before the gate reported.
    Timeout { phase: String, timeout_secs: u64 },
}

impl FailureCause {
    pub fn from_outcome(outcome: &GateOutcome) -> Self {
        match outcome.status {
            GateStatus::Error => Self::Error {
                detail: outcome.detail.clone(),
            },
            _ => Self::Failed {
                detail: outcome.detail.clone(),
            },
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { detail } if detail.is_empty() => f.write_str("gate failed"),
            Self::Failed { detail } => write!(f, "gate failed: {detail}"),
            Self::Error { detail } if detail.is_empty() => f.write_str("validator error"),
            Self::Error { detail } => write!(f, "validator error: {detail}"),
            Self::Timeout {
                phase,
                timeout_secs,
            } => write!(f, "phase '{phase}' timed out after {timeout_secs}s"),
        }
    }
}

/// A gate transitioning to failure, as seen by the failure resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub gate: GateType,
    pub repository: String,
    pub commit: String,
    pub tier: RepositoryTier,
    pub severity: Severity,
    pub cause: FailureCause,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        gate: GateType,
        repository: impl Into<String>,
        commit: impl Into<String>,
        tier: RepositoryTier,
        cause: FailureCause,
    ) -> Self {
        Self {
            gate,
            repository: repository.into(),
            commit: commit.into(),
            tier,
            severity: Severity::classify(gate, &cause, tier),
            cause,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_score_is_clamped() {
        let outcome = GateOutcome::success(GateType::CodeQuality).with_score(140.0);
        assert_eq!(outcome.score, Some(100.0));
    }

    #[test]
    fn test_update_json_is_flat() {
        let update = GateStatusUpdate::new(
            "org/api",
            "abc",
            GateOutcome::failure(GateType::UnitTests, "2 tests failed"),
        );
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["gate"], "unit_tests");
        assert_eq!(json["status"], "failure");
        assert_eq!(json["repository"], "org/api");
    }

    #[test]
    fn test_severity_classification() {
        let failed = FailureCause::Failed {
            detail: String::new(),
        };
        assert_eq!(
            Severity::classify(GateType::UnitTests, &failed, RepositoryTier::Standard),
            Severity::Medium
        );
        assert_eq!(
            Severity::classify(
                GateType::SecurityScan,
                &failed,
                RepositoryTier::MissionCritical
            ),
            Severity::Critical
        );
        let timeout = FailureCause::Timeout {
            phase: "Pre-commit Validation".into(),
            timeout_secs: 300,
        };
        assert_eq!(
            Severity::classify(GateType::UnitTests, &timeout, RepositoryTier::MissionCritical),
            Severity::Medium
        );
    }

    #[test]
    fn test_failure_cause_from_outcome() {
        let outcome = GateOutcome::new(GateType::UnitTests, GateStatus::Error).with_detail("oom");
        assert_eq!(
            FailureCause::from_outcome(&outcome),
            FailureCause::Error {
                detail: "oom".into()
            }
        );
    }
}
