//! Status projection: gate outcomes to external status checks, and the
//! aggregate compliance verdict.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{CheckState, GateOutcome, GateStatus, GateType, COMPLIANCE_CHECK};

/// Hosting platforms cap status descriptions at this many characters.
pub const MAX_DESCRIPTION_LEN: usize = 140;

/// One status-check write for one gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckUpdate {
    pub repository: String,
    pub commit: String,
    pub gate: GateType,
    /// Check context, e.g. `qms/unit_tests`.
    pub context: String,
    pub state: CheckState,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceVerdict {
    Success,
    Failure,
    Pending,
}

impl ComplianceVerdict {
    pub fn check_state(self) -> CheckState {
        match self {
            Self::Success => CheckState::Success,
            Self::Failure => CheckState::Failure,
            Self::Pending => CheckState::Pending,
        }
    }
}

impl fmt::Display for ComplianceVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Pending => "pending",
        };
        f.write_str(s)
    }
}

/// What the projector needs to know about one required gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateStanding {
    pub gate: GateType,
    pub status: GateStatus,
    pub score: Option<f64>,
    /// Bypass approved or escalation overridden.
    pub accepted: bool,
}

/// Aggregate compliance over a run's required gates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceSummary {
    pub verdict: ComplianceVerdict,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
    /// Gates counted as passed only because a human accepted their failure.
    pub bypassed: Vec<GateType>,
    /// Mean gate score, 0-100.
    pub score: u32,
    pub description: String,
}

impl ComplianceSummary {
    /// Context the summary is published under.
    pub fn context(&self) -> &'static str {
        COMPLIANCE_CHECK
    }

    pub fn check_state(&self) -> CheckState {
        self.verdict.check_state()
    }
}

/// Translates gate outcomes into status checks and compliance summaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusProjector;

impl StatusProjector {
    /// Check written for every required gate when a run starts.
    pub fn queued(repository: &str, commit: &str, gate: GateType) -> CheckUpdate {
        CheckUpdate {
            repository: repository.to_string(),
            commit: commit.to_string(),
            gate,
            context: gate.check_name(),
            state: CheckState::Pending,
            description: format!("{gate} validation queued"),
        }
    }

    /// Check write for a reported outcome.
    pub fn project(repository: &str, commit: &str, outcome: &GateOutcome) -> CheckUpdate {
        let gate = outcome.gate;
        let description = match outcome.status {
            GateStatus::Pending => format!("{gate} validation queued"),
            GateStatus::Running => format!("{gate} validation running"),
            GateStatus::Success => match outcome.score {
                Some(score) => format!("{gate} passed (score {score:.0}%)"),
                None => format!("{gate} passed"),
            },
            GateStatus::Failure if outcome.detail.is_empty() => format!("{gate} failed"),
            GateStatus::Failure => format!("{gate} failed: {}", outcome.detail),
            GateStatus::Error if outcome.detail.is_empty() => format!("{gate} validator error"),
            GateStatus::Error => format!("{gate} validator error: {}", outcome.detail),
            GateStatus::Cancelled => format!("{gate} validation cancelled"),
        };
        CheckUpdate {
            repository: repository.to_string(),
            commit: commit.to_string(),
            gate,
            context: gate.check_name(),
            state: outcome.status.check_state(),
            description: truncate(description),
        }
    }

    /// Check write with an explicit state and description.
    pub fn annotate(
        repository: &str,
        commit: &str,
        gate: GateType,
        state: CheckState,
        description: impl Into<String>,
    ) -> CheckUpdate {
        CheckUpdate {
            repository: repository.to_string(),
            commit: commit.to_string(),
            gate,
            context: gate.check_name(),
            state,
            description: truncate(description.into()),
        }
    }

    /// Aggregate the standings of every required gate.
    ///
    /// `success` iff every gate succeeded or was accepted; `failure` iff any
    /// gate failed, errored or was cancelled without being accepted;
    /// otherwise `pending`. An empty set is a success.
    pub fn compliance<I>(standings: I) -> ComplianceSummary
    where
        I: IntoIterator<Item = GateStanding>,
    {
        let mut total = 0;
        let mut passed = 0;
        let mut failed = 0;
        let mut pending = 0;
        let mut bypassed = Vec::new();
        let mut scores = Vec::new();

        for standing in standings {
            total += 1;
            match standing.status {
                GateStatus::Success => {
                    passed += 1;
                    scores.push(standing.score.unwrap_or(100.0));
                }
                _ if standing.accepted => {
                    passed += 1;
                    bypassed.push(standing.gate);
                    scores.push(standing.score.unwrap_or(0.0));
                }
                GateStatus::Failure | GateStatus::Error | GateStatus::Cancelled => {
                    failed += 1;
                    scores.push(standing.score.unwrap_or(0.0));
                }
                GateStatus::Pending | GateStatus::Running => pending += 1,
            }
        }

        let verdict = if failed > 0 {
            ComplianceVerdict::Failure
        } else if pending > 0 {
            ComplianceVerdict::Pending
        } else {
            ComplianceVerdict::Success
        };
        let score = if scores.is_empty() {
            if verdict == ComplianceVerdict::Success {
                100
            } else {
                0
            }
        } else {
            (scores.iter().sum::<f64>() / scores.len() as f64).round() as u32
        };

        let mut description = match verdict {
            ComplianceVerdict::Success => {
                format!("All quality gates passed ({passed}/{total}) - Score: {score}%")
            }
            ComplianceVerdict::Failure => format!(
                "Quality gates failed ({failed} failed, {passed} passed) - Score: {score}%"
            ),
            ComplianceVerdict::Pending => {
                format!("Quality validation in progress ({passed}/{total} completed)")
            }
        };
        if !bypassed.is_empty() {
            let names: Vec<&str> = bypassed.iter().map(|g| g.as_str()).collect();
            description.push_str(&format!(" - Bypassed: {}", names.join(", ")));
        }

        ComplianceSummary {
            verdict,
            total,
            passed,
            failed,
            pending,
            bypassed,
            score,
            description: truncate(description),
        }
    }
}

fn truncate(mut description: String) -> String {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        let cut = description
            .char_indices()
            .nth(MAX_DESCRIPTION_LEN - 3)
            .map(|(i, _)| i)
            .unwrap_or(description.len());
        description.truncate(cut);
        description.push_str("...");
    }
    description
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standing(gate: GateType, status: GateStatus) -> GateStanding {
        GateStanding {
            gate,
            status,
            score: None,
            accepted: false,
        }
    }

    #[test]
    fn test_all_success_is_success() {
        let summary = StatusProjector::compliance([
            standing(GateType::CodeQuality, GateStatus::Success),
            GateStanding {
                score: Some(80.0),
                ..standing(GateType::UnitTests, GateStatus::Success)
            },
        ]);
        assert_eq!(summary.verdict, ComplianceVerdict::Success);
        assert_eq!(summary.score, 90);
        assert_eq!(
            summary.description,
            "All quality gates passed (2/2) - Score: 90%"
        );
    }

    #[test]
    fn test_failure_wins_over_pending() {
        let summary = StatusProjector::compliance([
            standing(GateType::CodeQuality, GateStatus::Success),
            standing(GateType::UnitTests, GateStatus::Failure),
            standing(GateType::DodValidation, GateStatus::Running),
        ]);
        assert_eq!(summary.verdict, ComplianceVerdict::Failure);
        assert_eq!(
            summary.description,
            "Quality gates failed (1 failed, 1 passed) - Score: 50%"
        );
    }

    #[test]
    fn test_pending_when_any_gate_unreported() {
        let summary = StatusProjector::compliance([
            standing(GateType::CodeQuality, GateStatus::Success),
            standing(GateType::UnitTests, GateStatus::Pending),
        ]);
        assert_eq!(summary.verdict, ComplianceVerdict::Pending);
        assert_eq!(
            summary.description,
            "Quality validation in progress (1/2 completed)"
        );
    }

    #[test]
    fn test_accepted_failure_counts_as_passed() {
        let summary = StatusProjector::compliance([
            standing(GateType::CodeQuality, GateStatus::Success),
            GateStanding {
                accepted: true,
                ..standing(GateType::UnitTests, GateStatus::Failure)
            },
        ]);
        assert_eq!(summary.verdict, ComplianceVerdict::Success);
        assert_eq!(summary.bypassed, vec![GateType::UnitTests]);
        assert!(summary.description.ends_with("Bypassed: unit_tests"));
    }

    #[test]
    fn test_empty_set_is_success() {
        let summary = StatusProjector::compliance(Vec::new());
        assert_eq!(summary.verdict, ComplianceVerdict::Success);
        assert_eq!(summary.score, 100);
    }

    #[test]
    fn test_project_outcome_description() {
        let outcome = GateOutcome::failure(GateType::UnitTests, "3 tests failed");
        let check = StatusProjector::project("org/api", "abc", &outcome);
        assert_eq!(check.context, "qms/unit_tests");
        assert_eq!(check.state, CheckState::Failure);
        assert_eq!(check.description, "unit_tests failed: 3 tests failed");
    }

    #[test]
    fn test_long_description_is_truncated() {
        let outcome = GateOutcome::failure(GateType::UnitTests, "x".repeat(500));
        let check = StatusProjector::project("org/api", "abc", &outcome);
        assert_eq!(check.description.chars().count(), MAX_DESCRIPTION_LEN);
        assert!(check.description.ends_with("..."));
    }
}
