//! External collaborators the orchestrator drives.
//!
//! Transport (HTTP, auth, rate limiting) lives behind these traits; the core
//! depends only on the operation signatures and their success/failure contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{CollaboratorError, DispatchPriority, GateType, RepositoryTier};
use crate::plan::PhaseKind;
use crate::policy::{ReviewRequirements, TierPolicy};
use crate::status::{CheckUpdate, ComplianceSummary};

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// One gate the external workflow should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub gate: GateType,
    pub phase: PhaseKind,
    pub timeout_secs: u64,
    /// 0 for the first run, then one more per retry.
    pub attempt: u32,
}

/// A workflow-dispatch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDispatch {
    pub orchestration_id: String,
    pub repository: String,
    pub commit: String,
    pub git_ref: String,
    pub workflow_file: String,
    pub tier: RepositoryTier,
    pub environment: String,
    pub priority: DispatchPriority,
    #[serde(default)]
    pub pull_request: Option<u64>,
    pub gates: Vec<GateConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Queued,
    InProgress,
}

/// The external workflow's acknowledgement of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub status: WorkflowRunStatus,
}

/// Branch-protection rules for one repository branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRequest {
    pub repository: String,
    pub branch: String,
    pub tier: RepositoryTier,
    pub required_checks: Vec<String>,
    pub reviews: ReviewRequirements,
    pub enforce_admins: bool,
    /// Teams allowed to push. Empty means unrestricted.
    pub push_teams: Vec<String>,
}

impl ProtectionRequest {
    pub fn from_policy(
        repository: impl Into<String>,
        branch: impl Into<String>,
        policy: &TierPolicy,
    ) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
            tier: policy.tier,
            required_checks: policy.required_checks(),
            reviews: policy.reviews.clone(),
            enforce_admins: policy.enforce_admins,
            push_teams: policy.push_teams.clone(),
        }
    }
}

/// Starts and cancels the external validation workflow.
#[async_trait]
pub trait WorkflowTrigger: Send + Sync {
    async fn trigger(&self, dispatch: &WorkflowDispatch) -> CollaboratorResult<WorkflowRun>;

    /// Best-effort cancellation of a running workflow.
    async fn cancel(&self, repository: &str, run_id: &str) -> CollaboratorResult<()>;
}

/// Publishes commit status checks. Every call is idempotent per gate and state.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Register a pending check for every required gate.
    async fn initialize(
        &self,
        repository: &str,
        commit: &str,
        gates: &[GateType],
    ) -> CollaboratorResult<()>;

    async fn update(&self, update: &CheckUpdate) -> CollaboratorResult<()>;

    async fn batch_update(&self, updates: &[CheckUpdate]) -> CollaboratorResult<()>;

    /// Publish the aggregate `qms/compliance-status` check.
    async fn update_compliance(
        &self,
        repository: &str,
        commit: &str,
        summary: &ComplianceSummary,
    ) -> CollaboratorResult<()>;
}

/// Applies tier branch-protection rules.
#[async_trait]
pub trait BranchProtector: Send + Sync {
    async fn configure(&self, request: &ProtectionRequest) -> CollaboratorResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_request_from_policy() {
        let policy = TierPolicy::for_tier(RepositoryTier::MissionCritical);
        let request = ProtectionRequest::from_policy("org/api", "main", &policy);
        assert_eq!(request.reviews.required_approvals, 2);
        assert!(request.enforce_admins);
        assert_eq!(request.required_checks.len(), 10);
        assert_eq!(request.push_teams, vec!["platform-team".to_string()]);
    }

    #[test]
    fn test_dispatch_serializes_gate_configs() {
        let dispatch = WorkflowDispatch {
            orchestration_id: "orch-1".into(),
            repository: "org/api".into(),
            commit: "abc".into(),
            git_ref: "main".into(),
            workflow_file: "qms-quality-validation.yml".into(),
            tier: RepositoryTier::Standard,
            environment: "development".into(),
            priority: DispatchPriority::Normal,
            pull_request: None,
            gates: vec![GateConfig {
                gate: GateType::UnitTests,
                phase: PhaseKind::PreCommit,
                timeout_secs: 300,
                attempt: 0,
            }],
        };
        let json = serde_json::to_value(&dispatch).unwrap();
        assert_eq!(json["gates"][0]["gate"], "unit_tests");
        assert_eq!(json["gates"][0]["phase"], "pre_commit");
        assert_eq!(json["priority"], "normal");
    }
}
