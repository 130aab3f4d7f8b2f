//! Human decisions on failed gates and their tamper-evident audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{DecisionError, GateType};

/// Approval of a pending bypass. All three audit fields are mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassApproval {
    pub gate: GateType,
    pub approver: String,
    pub justification: String,
    /// Change or incident ticket covering the bypass.
    pub ticket: String,
}

impl BypassApproval {
    pub fn new(
        gate: GateType,
        approver: impl Into<String>,
        justification: impl Into<String>,
        ticket: impl Into<String>,
    ) -> Self {
        Self {
            gate,
            approver: approver.into(),
            justification: justification.into(),
            ticket: ticket.into(),
        }
    }

    /// Check the mandatory audit fields and the approver's authority.
    pub fn check(&self, approvers: &[String]) -> Result<(), DecisionError> {
        require("approver", &self.approver)?;
        require("justification", &self.justification)?;
        require("ticket", &self.ticket)?;
        authorize(&self.approver, approvers, "approve bypasses")
    }
}

/// Refusal of a pending bypass. The gate is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassRejection {
    pub gate: GateType,
    pub actor: String,
    pub reason: String,
}

impl BypassRejection {
    pub fn new(gate: GateType, actor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            gate,
            actor: actor.into(),
            reason: reason.into(),
        }
    }

    pub fn check(&self, approvers: &[String]) -> Result<(), DecisionError> {
        require("actor", &self.actor)?;
        require("reason", &self.reason)?;
        authorize(&self.actor, approvers, "reject bypasses")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOutcome {
    /// Accept the failed gate and let the run continue.
    Override,
    /// Fail the run.
    Block,
}

/// A reviewer's ruling on an escalated gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationDecision {
    pub gate: GateType,
    pub reviewer: String,
    pub outcome: EscalationOutcome,
    pub reason: String,
}

impl EscalationDecision {
    pub fn new(
        gate: GateType,
        reviewer: impl Into<String>,
        outcome: EscalationOutcome,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            gate,
            reviewer: reviewer.into(),
            outcome,
            reason: reason.into(),
        }
    }

    pub fn check(&self, reviewers: &[String]) -> Result<(), DecisionError> {
        require("reviewer", &self.reviewer)?;
        require("reason", &self.reason)?;
        authorize(&self.reviewer, reviewers, "decide escalations")
    }
}

fn require(field: &'static str, value: &str) -> Result<(), DecisionError> {
    if value.trim().is_empty() {
        Err(DecisionError::MissingAuditField(field))
    } else {
        Ok(())
    }
}

/// An empty allow-list admits any identified actor.
fn authorize(actor: &str, allowed: &[String], action: &str) -> Result<(), DecisionError> {
    if allowed.is_empty() || allowed.iter().any(|a| a == actor) {
        Ok(())
    } else {
        Err(DecisionError::Unauthorized {
            actor: actor.to_string(),
            action: action.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    BypassApproved,
    BypassRejected,
    EscalationOverridden,
    EscalationBlocked,
}

impl DecisionKind {
    /// Whether the decision lets the gate count as accepted.
    pub fn accepts_gate(self) -> bool {
        matches!(self, Self::BypassApproved | Self::EscalationOverridden)
    }
}

/// Immutable audit record for one human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionAuditRecord {
    pub orchestration_id: String,
    pub repository: String,
    pub commit: String,
    pub gate: GateType,
    pub kind: DecisionKind,
    pub actor: String,
    pub justification: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    pub recorded_at: DateTime<Utc>,
    /// SHA-256 over every other field, hex encoded.
    pub content_digest: String,
}

#[derive(Serialize)]
struct DigestPayload<'a> {
    orchestration_id: &'a str,
    repository: &'a str,
    commit: &'a str,
    gate: GateType,
    kind: DecisionKind,
    actor: &'a str,
    justification: &'a str,
    ticket: Option<&'a str>,
    recorded_at: String,
}

impl DecisionAuditRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn seal(
        orchestration_id: impl Into<String>,
        repository: impl Into<String>,
        commit: impl Into<String>,
        gate: GateType,
        kind: DecisionKind,
        actor: impl Into<String>,
        justification: impl Into<String>,
        ticket: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self {
            orchestration_id: orchestration_id.into(),
            repository: repository.into(),
            commit: commit.into(),
            gate,
            kind,
            actor: actor.into(),
            justification: justification.into(),
            ticket,
            recorded_at: now,
            content_digest: String::new(),
        };
        record.content_digest = record.compute_digest();
        record
    }

    fn compute_digest(&self) -> String {
        let payload = DigestPayload {
            orchestration_id: &self.orchestration_id,
            repository: &self.repository,
            commit: &self.commit,
            gate: self.gate,
            kind: self.kind,
            actor: &self.actor,
            justification: &self.justification,
            ticket: self.ticket.as_deref(),
            recorded_at: self.recorded_at.to_rfc3339(),
        };
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn verify_integrity(&self) -> bool {
        self.content_digest == self.compute_digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed() -> DecisionAuditRecord {
        DecisionAuditRecord::seal(
            "orch-1",
            "org/api",
            "abc",
            GateType::UnitTests,
            DecisionKind::BypassApproved,
            "alice",
            "flaky test, fix tracked",
            Some("OPS-42".into()),
            Utc::now(),
        )
    }

    #[test]
    fn test_seal_produces_sha256_hex() {
        let record = sealed();
        assert_eq!(record.content_digest.len(), 64);
        assert!(record.verify_integrity());
    }

    #[test]
    fn test_tampering_breaks_integrity() {
        let mut record = sealed();
        record.actor = "mallory".into();
        assert!(!record.verify_integrity());
    }

    #[test]
    fn test_bypass_requires_audit_fields() {
        let approval = BypassApproval::new(GateType::UnitTests, "alice", "", "OPS-1");
        assert_eq!(
            approval.check(&[]),
            Err(DecisionError::MissingAuditField("justification"))
        );
        let approval = BypassApproval::new(GateType::UnitTests, "alice", "why", " ");
        assert_eq!(
            approval.check(&[]),
            Err(DecisionError::MissingAuditField("ticket"))
        );
    }

    #[test]
    fn test_bypass_approver_allow_list() {
        let approval = BypassApproval::new(GateType::UnitTests, "bob", "why", "OPS-1");
        assert!(approval.check(&[]).is_ok());
        assert!(matches!(
            approval.check(&["alice".to_string()]),
            Err(DecisionError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_escalation_decision_check() {
        let decision = EscalationDecision::new(
            GateType::SecurityScan,
            "carol",
            EscalationOutcome::Block,
            "critical CVE",
        );
        assert!(decision.check(&["carol".to_string()]).is_ok());
        assert!(DecisionKind::EscalationOverridden.accepts_gate());
        assert!(!DecisionKind::EscalationBlocked.accepts_gate());
    }
}
