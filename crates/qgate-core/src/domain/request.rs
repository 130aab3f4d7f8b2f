//! Validation requests: what the caller asks the orchestrator to validate.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::error::ValidationError;
use super::gate::GateType;
use super::tier::RepositoryTier;

/// Caller-declared urgency of a validation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
    Emergency,
}

impl ValidationPriority {
    /// Priority passed on to the workflow dispatch.
    pub fn dispatch_priority(self) -> DispatchPriority {
        match self {
            Self::Low => DispatchPriority::Low,
            Self::Medium => DispatchPriority::Normal,
            Self::High => DispatchPriority::High,
            Self::Critical | Self::Emergency => DispatchPriority::Critical,
        }
    }
}

/// Priority understood by the workflow trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// A request to validate one commit of one repository.
///
/// This is the unvalidated wire shape: gate names are free text and the tier
/// may be missing. [`ValidationRequest::validate`] turns it into a
/// [`ValidatedRequest`] or rejects it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub repository: String,
    pub commit: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tier: Option<RepositoryTier>,
    /// Explicit gate subset. `None` means "whatever the tier requires".
    #[serde(default)]
    pub gates: Option<Vec<String>>,
    /// Gates to drop from the resolved set.
    #[serde(default)]
    pub skip_gates: Vec<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub pull_request: Option<u64>,
    #[serde(default)]
    pub priority: ValidationPriority,
}

impl ValidationRequest {
    pub fn new(
        repository: impl Into<String>,
        commit: impl Into<String>,
        tier: RepositoryTier,
    ) -> Self {
        Self {
            repository: repository.into(),
            commit: commit.into(),
            tier: Some(tier),
            ..Self::default()
        }
    }

    pub fn with_gates<I, S>(mut self, gates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gates = Some(gates.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_priority(mut self, priority: ValidationPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Check the request shape and normalize gate names.
    ///
    /// Legacy gate aliases are folded onto their canonical gate; `dor` is
    /// rejected because no validation phase runs it.
    pub fn validate(&self) -> Result<ValidatedRequest, ValidationError> {
        if self.repository.trim().is_empty() {
            return Err(ValidationError::MissingRepository);
        }
        if self.commit.trim().is_empty() {
            return Err(ValidationError::MissingCommit);
        }
        let tier = self.tier.ok_or(ValidationError::MissingTier)?;

        let explicit_gates = match &self.gates {
            None => None,
            Some(names) => {
                let gates = normalize_gates(names)?;
                if gates.is_empty() {
                    return Err(ValidationError::EmptyGateSet);
                }
                Some(gates)
            }
        };
        let skip_gates = normalize_gates(&self.skip_gates)?;

        Ok(ValidatedRequest {
            repository: self.repository.trim().to_string(),
            commit: self.commit.trim().to_string(),
            branch: self.branch.clone(),
            tier,
            explicit_gates,
            skip_gates,
            environment: self.environment.clone(),
            pull_request: self.pull_request,
            priority: self.priority,
        })
    }
}

fn normalize_gates(names: &[String]) -> Result<BTreeSet<GateType>, ValidationError> {
    names
        .iter()
        .map(|name| {
            let gate: GateType = name.parse()?;
            gate.canonical()
                .ok_or(ValidationError::UnplannableGate(gate))
        })
        .collect()
}

/// A request that passed validation. Immutable for the life of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedRequest {
    pub repository: String,
    pub commit: String,
    pub branch: Option<String>,
    pub tier: RepositoryTier,
    pub explicit_gates: Option<BTreeSet<GateType>>,
    pub skip_gates: BTreeSet<GateType>,
    pub environment: Option<String>,
    pub pull_request: Option<u64>,
    pub priority: ValidationPriority,
}
