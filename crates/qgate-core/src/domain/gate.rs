//! Quality gate kinds and per-gate statuses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::ValidationError;

/// Prefix of every status-check context published for a gate.
pub const CHECK_PREFIX: &str = "qms";

/// Status-check context carrying the aggregate compliance verdict.
pub const COMPLIANCE_CHECK: &str = "qms/compliance-status";

/// Kind of quality gate.
///
/// The last four variants are legacy names kept for compatibility with older
/// workflow definitions; [`GateType::canonical`] maps them onto the current set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    CodeQuality,
    SecurityScan,
    UnitTests,
    IntegrationTests,
    PerformanceTests,
    DodValidation,
    ComplianceAudit,
    SecurityReview,
    DocumentationCheck,
    /// Legacy: definition-of-ready.
    Dor,
    /// Legacy alias of `security_scan`.
    Security,
    /// Legacy alias of `code_quality`.
    CodingStandards,
    /// Legacy alias of `dod_validation`.
    Dod,
}

impl GateType {
    /// The nine gate types that can appear in a validation plan.
    pub const CANONICAL: [GateType; 9] = [
        GateType::CodeQuality,
        GateType::SecurityScan,
        GateType::UnitTests,
        GateType::IntegrationTests,
        GateType::PerformanceTests,
        GateType::DodValidation,
        GateType::ComplianceAudit,
        GateType::SecurityReview,
        GateType::DocumentationCheck,
    ];

    const LEGACY: [GateType; 4] = [
        GateType::Dor,
        GateType::Security,
        GateType::CodingStandards,
        GateType::Dod,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CodeQuality => "code_quality",
            Self::SecurityScan => "security_scan",
            Self::UnitTests => "unit_tests",
            Self::IntegrationTests => "integration_tests",
            Self::PerformanceTests => "performance_tests",
            Self::DodValidation => "dod_validation",
            Self::ComplianceAudit => "compliance_audit",
            Self::SecurityReview => "security_review",
            Self::DocumentationCheck => "documentation_check",
            Self::Dor => "dor",
            Self::Security => "security",
            Self::CodingStandards => "coding_standards",
            Self::Dod => "dod",
        }
    }

    pub fn is_legacy(self) -> bool {
        Self::LEGACY.contains(&self)
    }

    /// Map a legacy alias onto its canonical gate.
    ///
    /// Returns `None` for `dor`, which has no counterpart in any validation phase.
    pub fn canonical(self) -> Option<GateType> {
        match self {
            Self::Security => Some(Self::SecurityScan),
            Self::CodingStandards => Some(Self::CodeQuality),
            Self::Dod => Some(Self::DodValidation),
            Self::Dor => None,
            other => Some(other),
        }
    }

    /// Status-check context name, e.g. `qms/unit_tests`.
    pub fn check_name(self) -> String {
        format!("{CHECK_PREFIX}/{}", self.as_str())
    }
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let name = name.strip_prefix("qms/").unwrap_or(&name);
        Self::CANONICAL
            .into_iter()
            .chain(Self::LEGACY)
            .find(|gate| gate.as_str() == name)
            .ok_or_else(|| ValidationError::UnknownGateType(s.to_string()))
    }
}

/// Last known status of a gate within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Running,
    Success,
    Failure,
    Error,
    /// Set by the orchestrator when a run is cancelled; never reported by validators.
    Cancelled,
}

impl GateStatus {
    /// Whether the validator has finished with this gate.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Error | Self::Cancelled
        )
    }

    /// Failure or error: both are routed through the failure resolver.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failure | Self::Error)
    }

    /// External status-check state for this gate status.
    pub fn check_state(self) -> CheckState {
        match self {
            Self::Pending | Self::Running => CheckState::Pending,
            Self::Success => CheckState::Success,
            Self::Failure => CheckState::Failure,
            Self::Error | Self::Cancelled => CheckState::Error,
        }
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// State of a commit status check on the hosting platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pending,
    Success,
    Failure,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_set_has_no_legacy() {
        assert_eq!(GateType::CANONICAL.len(), 9);
        assert!(GateType::CANONICAL.iter().all(|g| !g.is_legacy()));
    }

    #[test]
    fn test_legacy_aliases_map_to_canonical() {
        assert_eq!(GateType::Security.canonical(), Some(GateType::SecurityScan));
        assert_eq!(
            GateType::CodingStandards.canonical(),
            Some(GateType::CodeQuality)
        );
        assert_eq!(GateType::Dod.canonical(), Some(GateType::DodValidation));
        assert_eq!(GateType::Dor.canonical(), None);
        assert_eq!(GateType::UnitTests.canonical(), Some(GateType::UnitTests));
    }

    #[test]
    fn test_parse_gate_names() {
        assert_eq!("unit_tests".parse::<GateType>().unwrap(), GateType::UnitTests);
        assert_eq!(
            "qms/security_scan".parse::<GateType>().unwrap(),
            GateType::SecurityScan
        );
        assert_eq!("DOD".parse::<GateType>().unwrap(), GateType::Dod);
        assert!(matches!(
            "smoke_tests".parse::<GateType>(),
            Err(ValidationError::UnknownGateType(_))
        ));
    }

    #[test]
    fn test_check_name() {
        assert_eq!(GateType::CodeQuality.check_name(), "qms/code_quality");
    }

    #[test]
    fn test_status_projection() {
        assert_eq!(GateStatus::Running.check_state(), CheckState::Pending);
        assert_eq!(GateStatus::Cancelled.check_state(), CheckState::Error);
        assert!(GateStatus::Error.is_failure());
        assert!(!GateStatus::Cancelled.is_failure());
        assert!(GateStatus::Cancelled.is_terminal());
        assert!(!GateStatus::Running.is_terminal());
    }
}
