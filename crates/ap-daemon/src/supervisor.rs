use std::sync::Arc;

use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::{EngineEvent, StatusPayload};
use ap_core::config::SupervisorConfig;
use ap_core::types::{EngineState, RunState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::lifecycle::EngineLifecycle;
use crate::state_machine::{RunEvent, RunStateMachine, StateMachineError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("restart budget exhausted after {restarts} unproductive restarts")]
    RestartExhausted { restarts: u32 },
    #[error("supervisor is already running")]
    AlreadyRunning,
    #[error("supervisor is not running")]
    NotRunning,
    #[error(transparent)]
    Transition(#[from] StateMachineError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub run_state: RunState,
    pub uptime_secs: u64,
    pub cooldown_remaining_secs: u64,
    pub restart_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub current_goal_id: Option<Uuid>,
    pub current_action_id: Option<Uuid>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Set once the restart budget is exhausted.
    pub fatal: Option<String>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Liveness monitor for the engine loop.
///
/// Each `check` compares the engine's last activity against the stall
/// threshold, honoring rest windows. A stalled engine is restarted only
/// once the cooldown since the previous restart has passed. Restarts after
/// which no activity is observed count against a fixed budget; when that is
/// spent the supervisor stops the engine and reports a fatal status.
pub struct Supervisor {
    config: SupervisorConfig,
    engine: Option<Arc<dyn EngineLifecycle>>,
    machine: RunStateMachine,
    state: EngineState,
    started_at: Option<DateTime<Utc>>,
    /// Stall clock origin when no newer activity exists.
    baseline: Option<DateTime<Utc>>,
    last_restart_at: Option<DateTime<Utc>>,
    unproductive_restarts: u32,
    fatal: Option<String>,
    bus: Option<EventBus>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            engine: None,
            machine: RunStateMachine::new(),
            state: EngineState::default(),
            started_at: None,
            baseline: None,
            last_restart_at: None,
            unproductive_restarts: 0,
            fatal: None,
            bus: None,
        }
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn run_state(&self) -> RunState {
        self.machine.state()
    }

    pub fn history(&self) -> &[(RunState, RunEvent, RunState)] {
        self.machine.history()
    }

    pub async fn start(&mut self, engine: Arc<dyn EngineLifecycle>, now: DateTime<Utc>) -> Result<()> {
        if self.machine.state() != RunState::Stopped {
            return Err(SupervisorError::AlreadyRunning);
        }
        self.fatal = None;
        self.unproductive_restarts = 0;
        self.state.restart_count = 0;
        self.state.cooldown_until = None;
        self.last_restart_at = None;
        self.started_at = Some(now);
        self.baseline = Some(now);

        engine.start().await;
        self.engine = Some(engine);
        self.apply(RunEvent::Start, now, "supervisor started")?;

        if self.config.is_resting(now) {
            self.enter_rest(now).await?;
        }
        Ok(())
    }

    /// Stop the engine. Stopping an already stopped supervisor is a no-op.
    pub async fn stop(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.machine.state() == RunState::Stopped {
            return Ok(());
        }
        if let Some(engine) = &self.engine {
            engine.stop().await;
        }
        self.apply(RunEvent::Stop, now, "supervisor stopped")?;
        Ok(())
    }

    /// One supervision pass. Returns the run state after the pass, or
    /// `RestartExhausted` when the engine has been given up on.
    pub async fn check(&mut self, now: DateTime<Utc>) -> Result<RunState> {
        let Some(engine) = self.engine.clone() else {
            return Ok(self.machine.state());
        };
        if self.machine.state() == RunState::Stopped {
            return Ok(RunState::Stopped);
        }

        self.observe(&*engine);
        let resting = self.config.is_resting(now);

        match self.machine.state() {
            RunState::Running | RunState::Stalled if resting => {
                self.enter_rest(now).await?;
                return Ok(self.machine.state());
            }
            RunState::Resting if !resting => {
                engine.set_resting(false).await;
                // Idle time spent resting does not count toward a stall.
                self.baseline = Some(now);
                self.apply(RunEvent::LeaveRest, now, "rest window ended")?;
                return Ok(self.machine.state());
            }
            RunState::Running if self.is_stalled(now) => {
                let idle = self.idle_secs(now);
                warn!(idle_secs = idle, "engine stalled");
                self.apply(RunEvent::Stall, now, &format!("no activity for {idle}s"))?;
            }
            _ => {}
        }

        if self.machine.state() != RunState::Stalled {
            return Ok(self.machine.state());
        }

        if self.unproductive_restarts >= self.config.max_unproductive_restarts {
            let restarts = self.unproductive_restarts;
            let msg = format!("restart budget exhausted after {restarts} unproductive restarts");
            error!(restarts, "giving up on engine");
            engine.stop().await;
            self.fatal = Some(msg.clone());
            self.apply(RunEvent::Stop, now, &msg)?;
            return Err(SupervisorError::RestartExhausted { restarts });
        }

        if let Some(until) = self.state.cooldown_until {
            if now < until {
                info!(cooldown_until = %until, "restart deferred by cooldown");
                return Ok(RunState::Stalled);
            }
        }

        self.restart(&*engine, now, false).await?;
        Ok(self.machine.state())
    }

    /// Operator-triggered restart. Ignores the cooldown for this one restart
    /// and does not count against the unproductive-restart budget.
    pub async fn force_restart(&mut self, now: DateTime<Utc>) -> Result<()> {
        let engine = self.engine.clone().ok_or(SupervisorError::NotRunning)?;
        match self.machine.state() {
            RunState::Running | RunState::Stalled => self.restart(&*engine, now, true).await,
            RunState::Stopped => Err(SupervisorError::NotRunning),
            RunState::Resting => Err(StateMachineError::InvalidTransition {
                state: RunState::Resting,
                event: RunEvent::Restart,
            }
            .into()),
        }
    }

    pub fn get_status(&self, now: DateTime<Utc>) -> SupervisorStatus {
        let uptime_secs = match (self.machine.state(), self.started_at) {
            (RunState::Stopped, _) | (_, None) => 0,
            (_, Some(start)) => (now - start).num_seconds().max(0) as u64,
        };
        let cooldown_remaining_secs = self
            .state
            .cooldown_until
            .map(|until| (until - now).num_seconds().max(0) as u64)
            .unwrap_or(0);
        SupervisorStatus {
            run_state: self.machine.state(),
            uptime_secs,
            cooldown_remaining_secs,
            restart_count: self.state.restart_count,
            cooldown_until: self.state.cooldown_until,
            current_goal_id: self.state.current_goal_id,
            current_action_id: self.state.current_action_id,
            last_activity_at: self.state.last_activity_at,
            fatal: self.fatal.clone(),
        }
    }

    pub fn engine_state(&self) -> &EngineState {
        &self.state
    }

    // -- internals ----------------------------------------------------------

    fn observe(&mut self, engine: &dyn EngineLifecycle) {
        let activity = engine.activity();
        self.state.current_goal_id = activity.current_goal_id;
        self.state.current_action_id = activity.current_action_id;
        self.state.last_activity_at = activity.last_activity_at;

        if let (Some(restarted), Some(last)) = (self.last_restart_at, activity.last_activity_at) {
            if last > restarted && self.unproductive_restarts > 0 {
                info!("engine productive again, restart budget reset");
                self.unproductive_restarts = 0;
            }
        }
    }

    fn last_sign_of_life(&self) -> Option<DateTime<Utc>> {
        match (self.state.last_activity_at, self.baseline) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        self.last_sign_of_life()
            .map(|t| (now - t).num_seconds())
            .unwrap_or(0)
    }

    fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.last_sign_of_life()
            .is_some_and(|t| now - t > self.config.stall_threshold())
    }

    async fn enter_rest(&mut self, now: DateTime<Utc>) -> Result<()> {
        if let Some(engine) = &self.engine {
            engine.set_resting(true).await;
        }
        self.apply(RunEvent::EnterRest, now, "rest window started")?;
        Ok(())
    }

    async fn restart(&mut self, engine: &dyn EngineLifecycle, now: DateTime<Utc>, forced: bool) -> Result<()> {
        engine.stop().await;
        engine.start().await;

        self.state.restart_count += 1;
        if !forced {
            self.unproductive_restarts += 1;
        }
        self.state.cooldown_until = Some(now + self.config.cooldown());
        self.last_restart_at = Some(now);
        self.baseline = Some(now);

        let reason = if forced { "forced restart" } else { "restarted after stall" };
        info!(
            restart_count = self.state.restart_count,
            unproductive = self.unproductive_restarts,
            forced,
            "engine restarted"
        );
        self.apply(RunEvent::Restart, now, reason)?;
        Ok(())
    }

    fn apply(&mut self, event: RunEvent, now: DateTime<Utc>, reason: &str) -> Result<RunState> {
        let from = self.machine.state();
        let to = self.machine.transition(event)?;
        self.state.run_state = to;
        if let Some(bus) = &self.bus {
            bus.publish(EngineEvent::StatusChanged(StatusPayload {
                from,
                to,
                restart_count: self.state.restart_count,
                reason: reason.to_string(),
                timestamp: now,
            }));
        }
        Ok(to)
    }
}
