//! Typed lifecycle events and the per-subscriber event bus.
//!
//! Every subscriber owns an unbounded channel. Publishing never calls back
//! into subscriber code, so it is safe from inside the orchestrator's
//! mutation path.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::OrchestrationStatus;
use crate::decision::DecisionKind;
use crate::domain::{GateStatus, GateType, Severity};
use crate::plan::PhaseKind;
use crate::resolver::{ResolutionAction, Urgency};
use crate::status::ComplianceVerdict;

/// One lifecycle transition of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    Started {
        orchestration_id: String,
        repository: String,
        commit: String,
        workflow_run_id: String,
    },
    PhaseStarted {
        orchestration_id: String,
        phase: PhaseKind,
    },
    GateUpdated {
        orchestration_id: String,
        gate: GateType,
        status: GateStatus,
        progress: u8,
    },
    GateRetried {
        orchestration_id: String,
        gate: GateType,
        attempt: u32,
    },
    BypassRequested {
        orchestration_id: String,
        gate: GateType,
        reason: String,
    },
    Escalated {
        orchestration_id: String,
        gate: GateType,
        severity: Severity,
        urgency: Urgency,
    },
    /// A gate failure was resolved without human input (block).
    FailureResolved {
        orchestration_id: String,
        gate: GateType,
        action: ResolutionAction,
    },
    DecisionRecorded {
        orchestration_id: String,
        gate: GateType,
        kind: DecisionKind,
        actor: String,
    },
    Completed {
        orchestration_id: String,
        verdict: ComplianceVerdict,
    },
    Failed {
        orchestration_id: String,
        reason: String,
    },
    Cancelled {
        orchestration_id: String,
        reason: String,
    },
    CollaboratorFailed {
        orchestration_id: String,
        operation: String,
        error: String,
    },
}

impl OrchestrationEvent {
    pub fn orchestration_id(&self) -> &str {
        match self {
            Self::Started {
                orchestration_id, ..
            }
            | Self::PhaseStarted {
                orchestration_id, ..
            }
            | Self::GateUpdated {
                orchestration_id, ..
            }
            | Self::GateRetried {
                orchestration_id, ..
            }
            | Self::BypassRequested {
                orchestration_id, ..
            }
            | Self::Escalated {
                orchestration_id, ..
            }
            | Self::FailureResolved {
                orchestration_id, ..
            }
            | Self::DecisionRecorded {
                orchestration_id, ..
            }
            | Self::Completed {
                orchestration_id, ..
            }
            | Self::Failed {
                orchestration_id, ..
            }
            | Self::Cancelled {
                orchestration_id, ..
            }
            | Self::CollaboratorFailed {
                orchestration_id, ..
            } => orchestration_id,
        }
    }

    /// Dotted event name used in logs, e.g. `gate.updated`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "orchestration.started",
            Self::PhaseStarted { .. } => "phase.started",
            Self::GateUpdated { .. } => "gate.updated",
            Self::GateRetried { .. } => "gate.retried",
            Self::BypassRequested { .. } => "gate.bypass_requested",
            Self::Escalated { .. } => "gate.escalated",
            Self::FailureResolved { .. } => "gate.failure_resolved",
            Self::DecisionRecorded { .. } => "decision.recorded",
            Self::Completed { .. } => "orchestration.completed",
            Self::Failed { .. } => "orchestration.failed",
            Self::Cancelled { .. } => "orchestration.cancelled",
            Self::CollaboratorFailed { .. } => "collaborator.failed",
        }
    }

    /// Terminal status the event moves its run into, if any.
    pub fn terminal_status(&self) -> Option<OrchestrationStatus> {
        match self {
            Self::Completed { .. } => Some(OrchestrationStatus::Completed),
            Self::Failed { .. } | Self::Cancelled { .. } => Some(OrchestrationStatus::Failed),
            _ => None,
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: OrchestrationEvent,
}

#[derive(Debug, Default)]
struct BusState {
    seq: u64,
    subscribers: Vec<mpsc::UnboundedSender<EventEnvelope>>,
}

/// Fan-out of lifecycle events to independent subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new subscription. Events published before this call are not replayed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, pruning closed ones.
    pub fn publish(&self, event: OrchestrationEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.seq += 1;
        let envelope = EventEnvelope {
            seq: state.seq,
            at: Utc::now(),
            event,
        };
        tracing::debug!(
            event = envelope.event.kind(),
            orchestration_id = %envelope.event.orchestration_id(),
            seq = envelope.seq,
            "publishing lifecycle event"
        );
        state
            .subscribers
            .retain(|tx| tx.send(envelope.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(id: &str) -> OrchestrationEvent {
        OrchestrationEvent::Failed {
            orchestration_id: id.into(),
            reason: "blocked".into(),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(failed("orch-1"));
        bus.publish(failed("orch-2"));

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap().seq, 1);
            let second = rx.recv().await.unwrap();
            assert_eq!(second.event.orchestration_id(), "orch-2");
        }
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        drop(rx);
        bus.publish(failed("orch-1"));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(failed("orch-1")).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["data"]["orchestration_id"], "orch-1");
        assert_eq!(failed("x").kind(), "orchestration.failed");
    }
}
