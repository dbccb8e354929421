use std::collections::VecDeque;

use ap_core::types::{Action, ActionFailure, ActionStatus, FailureKind, TransitionError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Resolved requests kept for inspection.
const HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// ApprovalState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

// ---------------------------------------------------------------------------
// ApprovalRequest
// ---------------------------------------------------------------------------

/// A manual-risk action waiting for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub action: Action,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ApprovalState,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// Unknown id, or the request was already resolved.
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

// ---------------------------------------------------------------------------
// ApprovalQueue
// ---------------------------------------------------------------------------

/// Actions awaiting approval, each with a fixed expiry.
///
/// Expiry is an implicit rejection: the action ends `rejected` with a
/// distinct failure message. Resolved requests leave the pending set, so a
/// second approve/reject reports `NotFound`.
pub struct ApprovalQueue {
    expiry: Duration,
    pending: Vec<ApprovalRequest>,
    history: VecDeque<ApprovalRequest>,
}

impl ApprovalQueue {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            pending: Vec::new(),
            history: VecDeque::new(),
        }
    }

    /// Queue a proposed action. Returns the approval id.
    pub fn enqueue(&mut self, action: Action, now: DateTime<Utc>) -> Result<Uuid> {
        if action.status != ActionStatus::Proposed {
            return Err(TransitionError::InvalidTransition {
                id: action.id,
                from: action.status,
                to: ActionStatus::Approved,
            }
            .into());
        }
        let id = Uuid::new_v4();
        info!(approval_id = %id, action_id = %action.id, title = %action.title, "approval requested");
        self.pending.push(ApprovalRequest {
            id,
            action,
            requested_at: now,
            expires_at: now + self.expiry,
            state: ApprovalState::Pending,
            resolved_at: None,
        });
        Ok(id)
    }

    /// Approve a pending request and hand back the approved action.
    pub fn approve(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<Action> {
        let mut req = self.take(id, now)?;
        req.action.transition(ActionStatus::Approved)?;
        info!(approval_id = %id, action_id = %req.action.id, "approved");
        Ok(self.resolve(req, ApprovalState::Approved, now))
    }

    /// Reject a pending request. Returns the rejected action.
    pub fn reject(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<Action> {
        let mut req = self.take(id, now)?;
        req.action.transition(ActionStatus::Rejected)?;
        req.action.error = Some(ActionFailure::new(FailureKind::Rejected, "rejected by operator"));
        info!(approval_id = %id, action_id = %req.action.id, "rejected");
        Ok(self.resolve(req, ApprovalState::Rejected, now))
    }

    /// Reject every request whose expiry has passed. Safe to call repeatedly;
    /// each request expires at most once.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        let (stale, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|r| r.expires_at <= now);
        self.pending = live;
        stale.into_iter().map(|req| self.expire(req, now)).collect()
    }

    pub fn pending(&self) -> &[ApprovalRequest] {
        &self.pending
    }

    pub fn get(&self, id: Uuid) -> Option<&ApprovalRequest> {
        self.pending.iter().find(|r| r.id == id)
    }

    /// Whether any action for `goal_id` is still awaiting a decision.
    pub fn has_pending_for(&self, goal_id: Uuid) -> bool {
        self.pending.iter().any(|r| r.action.goal_id == Some(goal_id))
    }

    /// Recently resolved requests, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ApprovalRequest> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove a live request. One already past its expiry is expired on the
    /// spot and reported as `NotFound`.
    fn take(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<ApprovalRequest> {
        let idx = self
            .pending
            .iter()
            .position(|r| r.id == id)
            .ok_or(ApprovalError::NotFound(id))?;
        let req = self.pending.remove(idx);
        if req.expires_at <= now {
            self.expire(req, now);
            return Err(ApprovalError::NotFound(id));
        }
        Ok(req)
    }

    fn expire(&mut self, mut req: ApprovalRequest, now: DateTime<Utc>) -> ApprovalRequest {
        if let Err(e) = req.action.transition(ActionStatus::Rejected) {
            warn!(approval_id = %req.id, error = %e, "expired request had unexpected state");
        }
        req.action.error = Some(ActionFailure::new(
            FailureKind::Rejected,
            format!("approval expired at {}", req.expires_at.to_rfc3339()),
        ));
        info!(approval_id = %req.id, action_id = %req.action.id, "approval expired");
        req.state = ApprovalState::Expired;
        req.resolved_at = Some(now);
        self.push_history(req.clone());
        req
    }

    fn resolve(&mut self, mut req: ApprovalRequest, state: ApprovalState, now: DateTime<Utc>) -> Action {
        req.state = state;
        req.resolved_at = Some(now);
        let action = req.action.clone();
        self.push_history(req);
        action
    }

    fn push_history(&mut self, req: ApprovalRequest) {
        self.history.push_back(req);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
