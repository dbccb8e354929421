use std::fmt;

use ap_core::types::RunState;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    Start,
    EnterRest,
    LeaveRest,
    Stall,
    Restart,
    Stop,
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunEvent::Start => "start",
            RunEvent::EnterRest => "enter_rest",
            RunEvent::LeaveRest => "leave_rest",
            RunEvent::Stall => "stall",
            RunEvent::Restart => "restart",
            RunEvent::Stop => "stop",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition { state: RunState, event: RunEvent },
}

// ---------------------------------------------------------------------------
// RunStateMachine
// ---------------------------------------------------------------------------

/// Longest history kept; older transitions are dropped.
const HISTORY_LIMIT: usize = 64;

#[derive(Debug, Clone)]
pub struct RunStateMachine {
    current: RunState,
    history: Vec<(RunState, RunEvent, RunState)>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Stopped,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[(RunState, RunEvent, RunState)] {
        &self.history
    }

    /// Valid transitions:
    /// - Stopped + Start     -> Running
    /// - Running + EnterRest -> Resting
    /// - Stalled + EnterRest -> Resting
    /// - Resting + LeaveRest -> Running
    /// - Running + Stall     -> Stalled
    /// - Stalled + Restart   -> Running
    /// - Running + Restart   -> Running (forced)
    /// - any but Stopped + Stop -> Stopped
    pub fn transition(&mut self, event: RunEvent) -> Result<RunState, StateMachineError> {
        let next = match (self.current, event) {
            (RunState::Stopped, RunEvent::Start) => RunState::Running,
            (RunState::Running | RunState::Stalled, RunEvent::EnterRest) => RunState::Resting,
            (RunState::Resting, RunEvent::LeaveRest) => RunState::Running,
            (RunState::Running, RunEvent::Stall) => RunState::Stalled,
            (RunState::Running | RunState::Stalled, RunEvent::Restart) => RunState::Running,
            (RunState::Running | RunState::Resting | RunState::Stalled, RunEvent::Stop) => {
                RunState::Stopped
            }
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }
        tracing::debug!(from = %from, event = %event, to = %next, "run state transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: RunEvent) -> bool {
        self.clone().transition(event).is_ok()
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
