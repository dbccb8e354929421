use ap_core::types::{ActionFailure, RunState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything the engine announces to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum EngineEvent {
    // Dispatch lifecycle
    ActionStarted {
        action_id: Uuid,
        goal_id: Option<Uuid>,
        title: String,
    },
    ActionCompleted {
        action_id: Uuid,
        goal_id: Option<Uuid>,
        executor: String,
        output: String,
        duration_ms: u64,
    },
    ActionFailed {
        action_id: Uuid,
        goal_id: Option<Uuid>,
        failure: ActionFailure,
    },

    // Proposal / approval
    ProposalsUpdated(ProposalsPayload),
    ApprovalRequested {
        approval_id: Uuid,
        action_id: Uuid,
        title: String,
        expires_at: DateTime<Utc>,
    },
    ApprovalExpired {
        approval_id: Uuid,
        action_id: Uuid,
    },

    // Goals
    MilestoneReached {
        goal_id: Uuid,
        title: String,
        threshold: f64,
    },
    GoalCompleted {
        goal_id: Uuid,
        title: String,
    },

    // Supervisor
    StatusChanged(StatusPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalsPayload {
    pub goal_id: Uuid,
    /// Actions queued for direct dispatch.
    pub auto: Vec<Uuid>,
    /// Actions waiting in the approval queue.
    pub awaiting_approval: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub from: RunState,
    pub to: RunState,
    pub restart_count: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    /// Kebab-case event name, e.g. `action-started`.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ActionStarted { .. } => "action-started",
            EngineEvent::ActionCompleted { .. } => "action-completed",
            EngineEvent::ActionFailed { .. } => "action-failed",
            EngineEvent::ProposalsUpdated(_) => "proposals-updated",
            EngineEvent::ApprovalRequested { .. } => "approval-requested",
            EngineEvent::ApprovalExpired { .. } => "approval-expired",
            EngineEvent::MilestoneReached { .. } => "milestone-reached",
            EngineEvent::GoalCompleted { .. } => "goal-completed",
            EngineEvent::StatusChanged(_) => "status-changed",
        }
    }

    /// The action this event concerns, if any.
    pub fn action_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::ActionStarted { action_id, .. }
            | EngineEvent::ActionCompleted { action_id, .. }
            | EngineEvent::ActionFailed { action_id, .. }
            | EngineEvent::ApprovalRequested { action_id, .. }
            | EngineEvent::ApprovalExpired { action_id, .. } => Some(*action_id),
            _ => None,
        }
    }
}
