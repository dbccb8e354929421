use std::sync::Arc;

use anyhow::{Context, Result};
use ap_agents::approval::ApprovalQueue;
use ap_agents::dispatcher::Dispatcher;
use ap_agents::goal_manager::GoalManager;
use ap_agents::registry::ExecutorRegistry;
use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::EngineEvent;
use ap_core::config::Config;
use ap_core::goal_store::GoalStore;
use ap_core::risk::RiskClassifier;
use ap_core::work_log::WorkLog;
use ap_harness::proposer::{ContextRegistry, NullProposer, Proposer};
use ap_harness::signal::StopSignal;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::lifecycle::EngineLifecycle;
use crate::runner::{EngineHandle, EngineRunner};
use crate::supervisor::{Supervisor, SupervisorError, SupervisorStatus};

/// Pluggable pieces the daemon cannot build from configuration alone.
pub struct DaemonParts {
    pub proposer: Arc<dyn Proposer>,
    pub context: ContextRegistry,
    pub executors: ExecutorRegistry,
}

impl DaemonParts {
    /// Executors from `[executors]`, no context providers, and a proposer
    /// that proposes nothing.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            proposer: Arc::new(NullProposer),
            context: ContextRegistry::new(),
            executors: ExecutorRegistry::from_config(config)
                .context("failed to build executor registry")?,
        })
    }
}

/// The autopilot daemon.
///
/// Builds every component once from [`Config`], then runs the supervisor
/// check loop until shutdown is triggered (e.g. via ctrl-c) or the restart
/// budget runs out.
pub struct Daemon {
    config: Config,
    bus: EventBus,
    runner: Arc<EngineRunner>,
    supervisor: Arc<Mutex<Supervisor>>,
    shutdown: StopSignal,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        let parts = DaemonParts::from_config(&config)?;
        Self::with_parts(config, parts)
    }

    pub fn with_parts(config: Config, parts: DaemonParts) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let bus = EventBus::new();
        let data_dir = config.data_dir();

        let store = GoalStore::open(data_dir.join("goals"))
            .with_context(|| format!("failed to open goal store in {}", data_dir.display()))?;
        let work_log = WorkLog::open(data_dir.join("work_log.jsonl"), config.work_log.retention)
            .context("failed to open work log")?;

        let dispatcher = Dispatcher::from_registry(
            &parts.executors,
            std::time::Duration::from_millis(config.dispatch.default_timeout_ms),
        )
        .with_events(bus.clone());

        let mut engine = Engine::new(
            GoalManager::new(store).with_events(bus.clone()),
            dispatcher,
            parts.proposer,
        )
        .with_work_log(work_log)
        .with_classifier(RiskClassifier::from_config(&config.risk))
        .with_approvals(ApprovalQueue::new(config.approval.expiry()))
        .with_context(parts.context)
        .with_events(bus.clone())
        .with_proposer_timeout(config.engine.proposer_timeout())
        .with_heartbeat(config.supervisor.heartbeat_interval());

        let interrupted = engine.recover_interrupted();
        if interrupted > 0 {
            warn!(count = interrupted, "marked interrupted actions from previous run");
        }

        let runner = Arc::new(EngineRunner::new(engine, config.engine.tick_interval()));
        let supervisor = Supervisor::new(config.supervisor.clone()).with_events(bus.clone());

        Ok(Self {
            config,
            bus,
            runner,
            supervisor: Arc::new(Mutex::new(supervisor)),
            shutdown: StopSignal::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn handle(&self) -> EngineHandle {
        self.runner.handle()
    }

    /// Signal that stops [`run`](Self::run) when triggered.
    pub fn shutdown_signal(&self) -> StopSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub async fn status(&self) -> SupervisorStatus {
        self.supervisor.lock().await.get_status(Utc::now())
    }

    pub async fn force_restart(&self) -> Result<()> {
        self.supervisor
            .lock()
            .await
            .force_restart(Utc::now())
            .await
            .context("forced restart failed")
    }

    /// Run until shutdown. Returns an error only when the supervisor gave up
    /// on the engine.
    pub async fn run(&self) -> Result<()> {
        let forwarder = tokio::spawn(forward_events(self.bus.subscribe(), self.shutdown.clone()));

        {
            let engine: Arc<dyn EngineLifecycle> = self.runner.clone();
            self.supervisor
                .lock()
                .await
                .start(engine, Utc::now())
                .await
                .context("failed to start supervisor")?;
        }
        info!(name = %self.config.general.name, "daemon running");

        let mut interval = tokio::time::interval(self.config.supervisor.check_interval());
        // Consume the first immediate tick; the engine just started.
        interval.tick().await;

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.triggered() => break Ok(()),
                _ = interval.tick() => {
                    let mut supervisor = self.supervisor.lock().await;
                    match supervisor.check(Utc::now()).await {
                        Ok(_) => {}
                        Err(SupervisorError::RestartExhausted { restarts }) => {
                            error!(restarts, "supervisor gave up; shutting down");
                            break Err(anyhow::anyhow!(
                                "engine made no progress after {restarts} restarts"
                            ));
                        }
                        Err(e) => error!(error = %e, "supervisor check failed"),
                    }
                }
            }
        };

        info!("daemon stopping");
        if let Err(e) = self.supervisor.lock().await.stop(Utc::now()).await {
            warn!(error = %e, "supervisor stop failed");
        }
        self.shutdown.trigger();
        if let Err(e) = forwarder.await {
            warn!(error = %e, "event forwarder ended abnormally");
        }
        outcome
    }
}

/// Trace every engine event until shutdown.
async fn forward_events(rx: flume::Receiver<EngineEvent>, shutdown: StopSignal) {
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            ev = rx.recv_async() => match ev {
                Ok(event) => log_event(&event),
                Err(_) => break,
            },
        }
    }
    // Drain whatever was published during shutdown.
    for event in rx.try_iter() {
        log_event(&event);
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::ActionFailed { action_id, failure, .. } => {
            warn!(event = event.name(), action_id = %action_id, error = %failure, "engine event")
        }
        EngineEvent::StatusChanged(status) => info!(
            event = event.name(),
            from = %status.from,
            to = %status.to,
            restart_count = status.restart_count,
            reason = %status.reason,
            "engine event"
        ),
        _ => info!(event = event.name(), action_id = ?event.action_id(), "engine event"),
    }
}
