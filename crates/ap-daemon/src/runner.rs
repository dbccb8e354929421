use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ap_agents::approval::ApprovalRequest;
use ap_agents::goal_manager::{ProgressDelta, SyncOutcome};
use ap_core::types::{Action, Goal, WorkLogEntry};
use ap_harness::signal::StopSignal;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{ActivityMonitor, EngineActivity};
use crate::engine::{Engine, Result};
use crate::lifecycle::EngineLifecycle;

/// How long `stop` waits for the loop task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(30);

struct LoopTask {
    handle: JoinHandle<()>,
    stop: StopSignal,
}

/// Owns the engine and drives it from a tick loop task.
///
/// The engine sits behind one async mutex; the loop holds it for a whole
/// tick and operator commands through [`EngineHandle`] take the same lock,
/// so every mutation happens on one logical turn. Restarting recycles only
/// the loop task; engine state carries over.
pub struct EngineRunner {
    engine: Arc<Mutex<Engine>>,
    activity: ActivityMonitor,
    tick_interval: Duration,
    resting: Arc<AtomicBool>,
    task: StdMutex<Option<LoopTask>>,
}

impl EngineRunner {
    pub fn new(engine: Engine, tick_interval: Duration) -> Self {
        let activity = engine.activity();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            activity,
            tick_interval,
            resting: Arc::new(AtomicBool::new(false)),
            task: StdMutex::new(None),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            engine: self.engine.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_slot()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    fn task_slot(&self) -> std::sync::MutexGuard<'_, Option<LoopTask>> {
        self.task.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn run_loop(
    engine: Arc<Mutex<Engine>>,
    tick_interval: Duration,
    resting: Arc<AtomicBool>,
    stop: StopSignal,
) {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(tick_secs = tick_interval.as_secs_f64(), "engine loop started");

    loop {
        tokio::select! {
            _ = stop.triggered() => break,
            _ = interval.tick() => {
                if resting.load(Ordering::SeqCst) {
                    debug!("resting, tick skipped");
                    continue;
                }
                let mut engine = engine.lock().await;
                if stop.is_triggered() {
                    break;
                }
                let report = engine.tick(Utc::now(), &stop).await;
                debug!(
                    goal_id = ?report.goal_id,
                    proposed = report.actions_proposed,
                    awaiting = report.queued_for_approval,
                    dispatched = report.dispatched.is_some(),
                    "tick finished"
                );
            }
        }
    }
    info!("engine loop stopped");
}

#[async_trait]
impl EngineLifecycle for EngineRunner {
    async fn start(&self) {
        let mut slot = self.task_slot();
        if slot.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }
        let stop = StopSignal::new();
        let handle = tokio::spawn(run_loop(
            self.engine.clone(),
            self.tick_interval,
            self.resting.clone(),
            stop.clone(),
        ));
        *slot = Some(LoopTask { handle, stop });
    }

    async fn stop(&self) {
        let Some(task) = self.task_slot().take() else {
            return;
        };
        task.stop.trigger();
        let abort = task.handle.abort_handle();
        match tokio::time::timeout(STOP_GRACE, task.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "engine loop task ended abnormally"),
            Err(_) => {
                warn!("engine loop did not stop in time, aborting");
                abort.abort();
            }
        }
    }

    async fn set_resting(&self, resting: bool) {
        self.resting.store(resting, Ordering::SeqCst);
    }

    fn activity(&self) -> EngineActivity {
        self.activity.snapshot()
    }
}

// ---------------------------------------------------------------------------
// EngineHandle
// ---------------------------------------------------------------------------

/// Operator access to the running engine.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Mutex<Engine>>,
}

impl EngineHandle {
    pub async fn approve(&self, approval_id: Uuid) -> Result<Action> {
        self.engine.lock().await.approve(approval_id, Utc::now())
    }

    pub async fn reject(&self, approval_id: Uuid) -> Result<Action> {
        self.engine.lock().await.reject(approval_id, Utc::now())
    }

    pub async fn add_goal(&self, goal: Goal, auto_activate: bool) -> Result<Uuid> {
        self.engine.lock().await.add_goal(goal, auto_activate)
    }

    pub async fn sync_progress(&self, goal_id: Uuid, delta: ProgressDelta) -> Result<SyncOutcome> {
        self.engine.lock().await.sync_progress(goal_id, delta)
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.engine.lock().await.pending_approvals().to_vec()
    }

    pub async fn goals(&self) -> Vec<Goal> {
        self.engine
            .lock()
            .await
            .goals()
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn recent_log(&self, n: usize) -> Vec<WorkLogEntry> {
        self.engine
            .lock()
            .await
            .work_log()
            .recent(n)
            .into_iter()
            .cloned()
            .collect()
    }
}
