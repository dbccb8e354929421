use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::EngineEvent;
use ap_core::goal_store::{GoalStore, GoalStoreError};
use ap_core::types::{Goal, GoalStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Applied sync keys remembered per goal; the oldest are forgotten first.
const SYNC_KEY_LIMIT: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GoalError {
    #[error("goal not found: {0}")]
    NotFound(Uuid),
    #[error("goal {0} is completed or archived")]
    Finished(Uuid),
    #[error(transparent)]
    Store(#[from] GoalStoreError),
}

pub type Result<T> = std::result::Result<T, GoalError>;

// ---------------------------------------------------------------------------
// Progress sync
// ---------------------------------------------------------------------------

/// An increment of progress identified by `key`.
///
/// Replaying a delta with a key the goal has already seen is a no-op, so the
/// same snapshot can be synced any number of times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressDelta {
    pub key: String,
    pub amount: f64,
}

impl ProgressDelta {
    pub fn new(key: impl Into<String>, amount: f64) -> Self {
        Self {
            key: key.into(),
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub applied: bool,
    pub progress: f64,
    /// Milestones crossed by this sync.
    pub milestones: Vec<String>,
    pub completed: bool,
}

// ---------------------------------------------------------------------------
// GoalManager
// ---------------------------------------------------------------------------

/// Owns the goal store and every mutation of it.
///
/// At most one goal is `active`; activating another sends the previous one
/// back to `pending`.
pub struct GoalManager {
    store: GoalStore,
    bus: Option<EventBus>,
}

impl GoalManager {
    pub fn new(store: GoalStore) -> Self {
        Self { store, bus: None }
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Store a new goal as `pending`, then activate it if asked.
    ///
    /// Whatever status, sync keys or milestone stamps the caller set are
    /// discarded; progress is clamped to `[0, 1]` with NaN read as zero.
    pub fn add_goal(&mut self, mut goal: Goal, auto_activate: bool) -> Result<Uuid> {
        goal.status = GoalStatus::Pending;
        goal.progress = if goal.progress.is_nan() {
            0.0
        } else {
            goal.progress.clamp(0.0, 1.0)
        };
        goal.applied_syncs.clear();
        for m in goal.milestones.iter_mut() {
            m.reached_at = None;
        }
        let id = self.store.insert(goal)?.id;
        info!(goal_id = %id, "goal added");
        if auto_activate {
            self.activate(id)?;
        }
        Ok(id)
    }

    /// Highest-priority selectable goal, ties broken by earliest creation.
    /// The chosen goal becomes the active one.
    pub fn select_current_goal(&mut self) -> Result<Option<Goal>> {
        let chosen = self
            .store
            .list()
            .into_iter()
            .filter(|g| g.status.is_selectable())
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|g| g.id);

        match chosen {
            Some(id) => {
                if self.store.get(id).map(|g| g.status) != Some(GoalStatus::Active) {
                    self.activate(id)?;
                }
                Ok(self.store.get(id).cloned())
            }
            None => Ok(None),
        }
    }

    pub fn activate(&mut self, id: Uuid) -> Result<()> {
        let mut goal = self.get_owned(id)?;
        if goal.is_finished() {
            return Err(GoalError::Finished(id));
        }

        let others: Vec<Goal> = self
            .store
            .list()
            .into_iter()
            .filter(|g| g.id != id && g.status == GoalStatus::Active)
            .cloned()
            .collect();
        for mut other in others {
            other.status = GoalStatus::Pending;
            other.updated_at = Utc::now();
            self.store.update(other)?;
        }

        if goal.status != GoalStatus::Active {
            goal.status = GoalStatus::Active;
            goal.updated_at = Utc::now();
            self.store.update(goal)?;
            info!(goal_id = %id, "goal activated");
        }
        Ok(())
    }

    /// Apply `delta` to the goal's progress, clamped to `[0, 1]`.
    ///
    /// Already-seen keys and non-positive amounts leave the goal untouched.
    /// Reaching `1.0` completes the goal.
    pub fn sync_progress(&mut self, id: Uuid, delta: ProgressDelta) -> Result<SyncOutcome> {
        let mut goal = self.get_owned(id)?;
        let unchanged = |goal: &Goal| SyncOutcome {
            applied: false,
            progress: goal.progress,
            milestones: Vec::new(),
            completed: goal.status == GoalStatus::Completed,
        };

        if goal.is_finished() || goal.applied_syncs.iter().any(|k| k == &delta.key) {
            debug!(goal_id = %id, key = %delta.key, "progress sync skipped");
            return Ok(unchanged(&goal));
        }
        if delta.amount.is_nan() || delta.amount <= 0.0 {
            debug!(goal_id = %id, amount = delta.amount, "non-positive progress ignored");
            return Ok(unchanged(&goal));
        }

        let now = Utc::now();
        goal.progress = (goal.progress + delta.amount).clamp(0.0, 1.0);
        goal.applied_syncs.push(delta.key);
        if goal.applied_syncs.len() > SYNC_KEY_LIMIT {
            let excess = goal.applied_syncs.len() - SYNC_KEY_LIMIT;
            goal.applied_syncs.drain(..excess);
        }

        let mut crossed = Vec::new();
        for milestone in goal.milestones.iter_mut() {
            if !milestone.is_reached() && goal.progress >= milestone.threshold {
                milestone.reached_at = Some(now);
                crossed.push((milestone.title.clone(), milestone.threshold));
            }
        }

        let completed = goal.progress >= 1.0;
        if completed {
            goal.progress = 1.0;
            goal.status = GoalStatus::Completed;
        }
        goal.updated_at = now;

        let title = goal.title.clone();
        let progress = goal.progress;
        self.store.update(goal)?;
        info!(goal_id = %id, progress, "progress synced");

        for (milestone, threshold) in &crossed {
            info!(goal_id = %id, milestone = %milestone, "milestone reached");
            self.publish(EngineEvent::MilestoneReached {
                goal_id: id,
                title: milestone.clone(),
                threshold: *threshold,
            });
        }
        if completed {
            info!(goal_id = %id, "goal completed");
            self.publish(EngineEvent::GoalCompleted { goal_id: id, title });
        }

        Ok(SyncOutcome {
            applied: true,
            progress,
            milestones: crossed.into_iter().map(|(t, _)| t).collect(),
            completed,
        })
    }

    /// Zero the goal's progress and forget its applied syncs and milestones.
    /// A completed goal goes back to `pending`.
    pub fn reset_progress(&mut self, id: Uuid) -> Result<()> {
        let mut goal = self.get_owned(id)?;
        if goal.status == GoalStatus::Archived {
            return Err(GoalError::Finished(id));
        }
        goal.progress = 0.0;
        goal.applied_syncs.clear();
        for m in goal.milestones.iter_mut() {
            m.reached_at = None;
        }
        if goal.status == GoalStatus::Completed {
            goal.status = GoalStatus::Pending;
        }
        goal.updated_at = Utc::now();
        self.store.update(goal)?;
        info!(goal_id = %id, "progress reset");
        Ok(())
    }

    pub fn archive(&mut self, id: Uuid) -> Result<()> {
        let mut goal = self.get_owned(id)?;
        goal.status = GoalStatus::Archived;
        goal.updated_at = Utc::now();
        self.store.update(goal)?;
        info!(goal_id = %id, "goal archived");
        Ok(())
    }

    pub fn remove(&mut self, id: Uuid) -> Result<Goal> {
        let removed = self.store.remove(id)?.ok_or(GoalError::NotFound(id))?;
        info!(goal_id = %id, "goal removed");
        Ok(removed)
    }

    pub fn get(&self, id: Uuid) -> Option<&Goal> {
        self.store.get(id)
    }

    pub fn list(&self) -> Vec<&Goal> {
        self.store.list()
    }

    /// The goal currently marked `active`, if any.
    pub fn current(&self) -> Option<&Goal> {
        self.store
            .list()
            .into_iter()
            .find(|g| g.status == GoalStatus::Active)
    }

    fn get_owned(&self, id: Uuid) -> Result<Goal> {
        self.store.get(id).cloned().ok_or(GoalError::NotFound(id))
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
