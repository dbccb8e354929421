use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// GoalStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    Active,
    Completed,
    Archived,
}

impl GoalStatus {
    /// Returns `true` when the goal can still be picked as the current goal.
    pub fn is_selectable(&self) -> bool {
        matches!(self, GoalStatus::Pending | GoalStatus::Active)
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GoalStatus::Pending => "pending",
            GoalStatus::Active => "active",
            GoalStatus::Completed => "completed",
            GoalStatus::Archived => "archived",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Milestone
// ---------------------------------------------------------------------------

/// A progress threshold on a goal. Crossing it emits a milestone event once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub title: String,
    /// Progress value in `(0, 1]` at which the milestone is reached.
    pub threshold: f64,
    #[serde(default)]
    pub reached_at: Option<DateTime<Utc>>,
}

impl Milestone {
    pub fn new(title: impl Into<String>, threshold: f64) -> Self {
        Self {
            title: title.into(),
            threshold: threshold.clamp(0.0, 1.0),
            reached_at: None,
        }
    }

    pub fn is_reached(&self) -> bool {
        self.reached_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Goal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    /// Store sequence number, assigned on first insert.
    #[serde(default)]
    pub seq: u64,
    pub title: String,
    pub category: String,
    /// Higher is more urgent.
    pub priority: i32,
    pub status: GoalStatus,
    pub progress: f64,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    /// Keys of progress syncs already applied to this goal.
    #[serde(default)]
    pub applied_syncs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(title: impl Into<String>, category: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            title: title.into(),
            category: category.into(),
            priority: 0,
            status: GoalStatus::Pending,
            progress: 0.0,
            milestones: Vec::new(),
            applied_syncs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_milestone(mut self, title: impl Into<String>, threshold: f64) -> Self {
        self.milestones.push(Milestone::new(title, threshold));
        self
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, GoalStatus::Completed | GoalStatus::Archived)
    }
}

// ---------------------------------------------------------------------------
// ActionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Proposed,
    Approved,
    Rejected,
    Executing,
    Completed,
    Failed,
}

impl ActionStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// The graph is one-directional:
    /// `Proposed -> Approved -> Executing -> {Completed, Failed}` or
    /// `Proposed -> Rejected`. Nothing ever returns to `Proposed`.
    pub fn can_transition_to(&self, target: &ActionStatus) -> bool {
        matches!(
            (self, target),
            (ActionStatus::Proposed, ActionStatus::Approved)
                | (ActionStatus::Proposed, ActionStatus::Rejected)
                | (ActionStatus::Approved, ActionStatus::Executing)
                | (ActionStatus::Executing, ActionStatus::Completed)
                | (ActionStatus::Executing, ActionStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Rejected | ActionStatus::Completed | ActionStatus::Failed
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionStatus::Proposed => "proposed",
            ActionStatus::Approved => "approved",
            ActionStatus::Rejected => "rejected",
            ActionStatus::Executing => "executing",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// RiskLevel
// ---------------------------------------------------------------------------

/// Approval requirement for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Safe to execute unattended.
    Auto,
    /// Requires explicit human sign-off.
    #[default]
    Manual,
}

// ---------------------------------------------------------------------------
// ExecutionPlan / ActionResult / ActionFailure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Executor to try first; the rest of the chain keeps its order.
    #[serde(default)]
    pub executor_hint: Option<String>,
    /// Opaque, executor-specific input.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Per-dispatch timeout. Falls back to the configured default when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub output: String,
    /// Name of the executor that produced the result.
    pub executor: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The task itself failed; no fallback was attempted.
    Execution,
    Timeout,
    RateLimited,
    Unavailable,
    /// Aborted by a supervisor stop.
    Cancelled,
    /// Every executor in the chain was tried without success.
    Exhausted,
    /// No executor in the chain reported ready.
    NoExecutor,
    /// Expired or declined while awaiting approval.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ActionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransitionError {
    #[error("action {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: ActionStatus,
        to: ActionStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    #[serde(default)]
    pub goal_id: Option<Uuid>,
    pub title: String,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub risk: RiskLevel,
    pub status: ActionStatus,
    #[serde(default)]
    pub execution_plan: ExecutionPlan,
    /// Opaque classifier input (e.g. `{"irreversible": true}`).
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Progress credited to the goal when this action completes.
    #[serde(default)]
    pub progress_weight: f64,
    #[serde(default)]
    pub result: Option<ActionResult>,
    #[serde(default)]
    pub error: Option<ActionFailure>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Action {
    pub fn new(title: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal_id: None,
            title: title.into(),
            action_type: action_type.into(),
            risk: RiskLevel::Manual,
            status: ActionStatus::Proposed,
            execution_plan: ExecutionPlan::default(),
            metadata: serde_json::Value::Null,
            progress_weight: 0.0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn for_goal(mut self, goal_id: Uuid) -> Self {
        self.goal_id = Some(goal_id);
        self
    }

    pub fn with_plan(mut self, plan: ExecutionPlan) -> Self {
        self.execution_plan = plan;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_progress_weight(mut self, weight: f64) -> Self {
        self.progress_weight = weight;
        self
    }

    /// Move the action to `next`, stamping lifecycle timestamps.
    pub fn transition(&mut self, next: ActionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(&next) {
            return Err(TransitionError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            ActionStatus::Executing => self.started_at = Some(now),
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Rejected => {
                self.ended_at = Some(now)
            }
            ActionStatus::Proposed | ActionStatus::Approved => {}
        }
        tracing::debug!(action_id = %self.id, from = %self.status, to = %next, "action transition");
        self.status = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WorkLogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Success,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkLogEntry {
    /// Assigned by the work log on append.
    #[serde(default)]
    pub seq: u64,
    pub source: String,
    pub message: String,
    pub status: LogStatus,
    #[serde(default)]
    pub action_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl WorkLogEntry {
    pub fn new(source: impl Into<String>, message: impl Into<String>, status: LogStatus) -> Self {
        Self {
            seq: 0,
            source: source.into(),
            message: message.into(),
            status,
            action_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_action(mut self, action_id: Uuid) -> Self {
        self.action_id = Some(action_id);
        self
    }
}

// ---------------------------------------------------------------------------
// RunState / EngineState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Stopped,
    Running,
    Resting,
    Stalled,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Stopped => "stopped",
            RunState::Running => "running",
            RunState::Resting => "resting",
            RunState::Stalled => "stalled",
        };
        write!(f, "{}", label)
    }
}

/// Liveness bookkeeping owned by the supervisor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineState {
    pub run_state: RunState,
    pub current_goal_id: Option<Uuid>,
    pub current_action_id: Option<Uuid>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
