use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Last observed engine progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineActivity {
    pub last_activity_at: Option<DateTime<Utc>>,
    pub current_goal_id: Option<Uuid>,
    pub current_action_id: Option<Uuid>,
}

/// Shared liveness record. The engine touches it whenever it makes progress;
/// the supervisor compares the timestamp against its stall threshold.
#[derive(Debug, Clone, Default)]
pub struct ActivityMonitor {
    inner: Arc<Mutex<EngineActivity>>,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record progress at `now`.
    pub fn touch(&self, now: DateTime<Utc>) {
        let mut a = self.lock();
        if a.last_activity_at.is_none_or(|prev| now > prev) {
            a.last_activity_at = Some(now);
        }
    }

    pub fn set_goal(&self, goal_id: Option<Uuid>) {
        self.lock().current_goal_id = goal_id;
    }

    pub fn set_action(&self, action_id: Option<Uuid>) {
        self.lock().current_action_id = action_id;
    }

    pub fn snapshot(&self) -> EngineActivity {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, EngineActivity> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
