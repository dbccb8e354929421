//! End-to-end engine cycles with a scripted proposer and fake executors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ap_agents::approval::ApprovalQueue;
use ap_agents::dispatcher::Dispatcher;
use ap_agents::goal_manager::GoalManager;
use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::EngineEvent;
use ap_core::goal_store::GoalStore;
use ap_core::types::{Action, ActionStatus, Goal, GoalStatus, LogStatus, WorkLogEntry};
use ap_core::work_log::WorkLog;
use ap_daemon::engine::Engine;
use ap_harness::executor::{ExecutionOutput, Executor, ExecutorError};
use ap_harness::proposer::{Context, ProposalError, Proposer};
use ap_harness::signal::StopSignal;
use async_trait::async_trait;
use chrono::Utc;

// ===========================================================================
// Fakes
// ===========================================================================

/// Hands out one queued batch per `propose` call, then nothing.
#[derive(Default)]
struct ScriptedProposer {
    batches: Mutex<VecDeque<Vec<Action>>>,
    goals: Mutex<VecDeque<Vec<Goal>>>,
    propose_calls: AtomicUsize,
    goal_calls: AtomicUsize,
}

impl ScriptedProposer {
    fn with_actions(actions: Vec<Action>) -> Arc<Self> {
        let p = Self::default();
        p.batches.lock().unwrap().push_back(actions);
        Arc::new(p)
    }

    fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Proposer for ScriptedProposer {
    async fn propose(&self, _goal: &Goal, _context: &Context) -> Result<Vec<Action>, ProposalError> {
        self.propose_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn propose_goals(&self, _context: &Context) -> Result<Vec<Goal>, ProposalError> {
        self.goal_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.goals.lock().unwrap().pop_front().unwrap_or_default())
    }
}

struct FakeExecutor {
    name: &'static str,
    outcome: Result<&'static str, ExecutorError>,
    calls: AtomicUsize,
}

impl FakeExecutor {
    fn ok(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            outcome: Ok("done"),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(name: &'static str, err: ExecutorError) -> Arc<Self> {
        Arc::new(Self {
            name,
            outcome: Err(err),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &str {
        self.name
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn execute(&self, _action: &Action, _timeout: Duration) -> Result<ExecutionOutput, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone().map(ExecutionOutput::new)
    }

    async fn cancel(&self) {}
}

fn engine(proposer: Arc<ScriptedProposer>, chain: Vec<Arc<FakeExecutor>>, bus: &EventBus) -> Engine {
    let chain = chain.into_iter().map(|e| e as Arc<dyn Executor>).collect();
    Engine::new(
        GoalManager::new(GoalStore::in_memory()).with_events(bus.clone()),
        Dispatcher::new(chain, Duration::from_secs(5)).with_events(bus.clone()),
        proposer,
    )
    .with_events(bus.clone())
}

fn drain(rx: &flume::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    rx.try_iter().collect()
}

// ===========================================================================
// Cycles
// ===========================================================================

#[tokio::test]
async fn test_empty_store_and_no_proposals_dispatches_nothing() {
    let bus = EventBus::new();
    let proposer = ScriptedProposer::empty();
    let exec = FakeExecutor::ok("primary");
    let mut engine = engine(proposer.clone(), vec![exec.clone()], &bus);

    let report = engine.tick(Utc::now(), &StopSignal::new()).await;

    assert!(report.no_actionable_work);
    assert!(report.goal_id.is_none());
    assert!(report.dispatched.is_none());
    assert_eq!(proposer.goal_calls.load(Ordering::SeqCst), 1);
    assert_eq!(proposer.propose_calls.load(Ordering::SeqCst), 0);
    assert!(engine.goals().current().is_none());
    assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_proposed_goal_is_stored_without_activation() {
    let bus = EventBus::new();
    let proposer = ScriptedProposer::empty();
    proposer
        .goals
        .lock()
        .unwrap()
        .push_back(vec![Goal::new("write docs", "docs")]);
    let mut engine = engine(proposer, vec![FakeExecutor::ok("primary")], &bus);

    let report = engine.tick(Utc::now(), &StopSignal::new()).await;
    assert_eq!(report.goals_proposed, 1);
    assert!(!report.no_actionable_work);
    assert_eq!(engine.goals().list().len(), 1);
    assert_eq!(engine.goals().list()[0].status, GoalStatus::Pending);
}

#[tokio::test]
async fn test_auto_action_runs_without_approval() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let proposer = ScriptedProposer::with_actions(vec![Action::new("survey prior art", "research")]);
    let exec = FakeExecutor::ok("primary");
    let mut engine = engine(proposer, vec![exec.clone()], &bus);
    let goal_id = engine.add_goal(Goal::new("ship", "product"), true).unwrap();

    let report = engine.tick(Utc::now(), &StopSignal::new()).await;

    assert_eq!(report.goal_id, Some(goal_id));
    assert_eq!(report.actions_proposed, 1);
    assert_eq!(report.queued_for_approval, 0);
    assert!(engine.pending_approvals().is_empty());

    let dispatched = report.dispatched.expect("action dispatched");
    assert_eq!(dispatched.action.status, ActionStatus::Completed);
    assert!(dispatched.action.result.as_ref().unwrap().success);
    assert_eq!(dispatched.action.goal_id, Some(goal_id));

    let events = drain(&rx);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::ActionCompleted { executor, .. } if executor == "primary"
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::ApprovalRequested { .. })));
}

#[tokio::test]
async fn test_manual_action_waits_for_approval_then_runs_next_tick() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let proposer = ScriptedProposer::with_actions(vec![Action::new("email the customer", "outreach")]);
    let exec = FakeExecutor::ok("primary");
    let mut engine = engine(proposer, vec![exec.clone()], &bus);
    engine.add_goal(Goal::new("close deal", "sales"), true).unwrap();
    let stop = StopSignal::new();

    let first = engine.tick(Utc::now(), &stop).await;
    assert_eq!(first.queued_for_approval, 1);
    assert!(first.dispatched.is_none());
    assert_eq!(exec.calls.load(Ordering::SeqCst), 0);

    let pending = engine.pending_approvals().to_vec();
    assert_eq!(pending.len(), 1);
    assert!(drain(&rx)
        .iter()
        .any(|e| matches!(e, EngineEvent::ApprovalRequested { approval_id, .. } if *approval_id == pending[0].id)));

    let approved = engine.approve(pending[0].id, Utc::now()).unwrap();
    assert_eq!(approved.status, ActionStatus::Approved);
    assert_eq!(engine.ready_len(), 1);

    let second = engine.tick(Utc::now(), &stop).await;
    let dispatched = second.dispatched.expect("approved action dispatched");
    assert_eq!(dispatched.action.id, approved.id);
    assert!(dispatched.succeeded());
    assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_goal_with_pending_approval_is_not_reproposed() {
    let bus = EventBus::new();
    let proposer = ScriptedProposer::with_actions(vec![Action::new("deploy", "deploy")]);
    let mut engine = engine(proposer.clone(), vec![FakeExecutor::ok("primary")], &bus);
    engine.add_goal(Goal::new("release", "ops"), true).unwrap();
    let stop = StopSignal::new();

    engine.tick(Utc::now(), &stop).await;
    engine.tick(Utc::now(), &stop).await;
    assert_eq!(proposer.propose_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_action_never_runs() {
    let bus = EventBus::new();
    let proposer = ScriptedProposer::with_actions(vec![Action::new("post publicly", "publish")]);
    let exec = FakeExecutor::ok("primary");
    let mut engine = engine(proposer, vec![exec.clone()], &bus);
    engine.add_goal(Goal::new("announce", "marketing"), true).unwrap();
    let stop = StopSignal::new();

    engine.tick(Utc::now(), &stop).await;
    let id = engine.pending_approvals()[0].id;
    let rejected = engine.reject(id, Utc::now()).unwrap();
    assert_eq!(rejected.status, ActionStatus::Rejected);
    assert!(engine.approve(id, Utc::now()).is_err());

    let report = engine.tick(Utc::now(), &stop).await;
    assert!(report.dispatched.is_none());
    assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rate_limited_primary_falls_back_and_logs_once() {
    let bus = EventBus::new();
    let proposer = ScriptedProposer::with_actions(vec![Action::new("summarise findings", "analysis")]);
    let primary = FakeExecutor::failing("primary", ExecutorError::RateLimited { retry_after_ms: None });
    let secondary = FakeExecutor::ok("secondary");
    let mut engine = engine(proposer, vec![primary.clone(), secondary.clone()], &bus);
    engine.add_goal(Goal::new("report", "research"), true).unwrap();

    let report = engine.tick(Utc::now(), &StopSignal::new()).await;
    let dispatched = report.dispatched.expect("dispatched");
    assert_eq!(dispatched.action.status, ActionStatus::Completed);
    assert_eq!(dispatched.action.result.as_ref().unwrap().executor, "secondary");
    assert_eq!(dispatched.fallbacks, 1);

    let fallback_entries: Vec<&WorkLogEntry> = engine
        .work_log()
        .for_action(dispatched.action.id)
        .into_iter()
        .filter(|e| e.message.contains("fallback"))
        .collect();
    assert_eq!(fallback_entries.len(), 1);
    assert!(fallback_entries[0].message.contains("primary"));
}

#[tokio::test]
async fn test_failed_action_is_logged_as_error() {
    let bus = EventBus::new();
    let proposer = ScriptedProposer::with_actions(vec![Action::new("crunch", "analysis")]);
    let primary = FakeExecutor::failing("primary", ExecutorError::Failed("exit 1".into()));
    let mut engine = engine(proposer, vec![primary], &bus);
    engine.add_goal(Goal::new("numbers", "finance"), true).unwrap();

    let report = engine.tick(Utc::now(), &StopSignal::new()).await;
    let dispatched = report.dispatched.unwrap();
    assert_eq!(dispatched.action.status, ActionStatus::Failed);

    let last = engine
        .work_log()
        .for_action(dispatched.action.id)
        .last()
        .map(|e| e.status);
    assert_eq!(last, Some(LogStatus::Error));
}

#[tokio::test]
async fn test_successful_action_credits_goal_progress() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let proposer = ScriptedProposer::with_actions(vec![
        Action::new("draft outline", "planning").with_progress_weight(0.5),
    ]);
    let mut engine = engine(proposer, vec![FakeExecutor::ok("primary")], &bus);
    let goal_id = engine
        .add_goal(Goal::new("book", "writing").with_milestone("halfway", 0.5), true)
        .unwrap();

    engine.tick(Utc::now(), &StopSignal::new()).await;

    let goal = engine.goals().get(goal_id).unwrap();
    assert!((goal.progress - 0.5).abs() < f64::EPSILON);
    assert!(goal.milestones[0].is_reached());
    assert!(drain(&rx)
        .iter()
        .any(|e| matches!(e, EngineEvent::MilestoneReached { title, .. } if title == "halfway")));
}

#[tokio::test]
async fn test_stale_approval_expires_on_later_tick() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let proposer = ScriptedProposer::with_actions(vec![Action::new("wire funds", "payment")]);
    let mut engine = engine(proposer, vec![FakeExecutor::ok("primary")], &bus)
        .with_approvals(ApprovalQueue::new(chrono::Duration::seconds(60)));
    engine.add_goal(Goal::new("pay vendor", "finance"), true).unwrap();
    let stop = StopSignal::new();
    let start = Utc::now();

    engine.tick(start, &stop).await;
    let approval_id = engine.pending_approvals()[0].id;

    let report = engine.tick(start + chrono::Duration::seconds(61), &stop).await;
    assert_eq!(report.expired_approvals, 1);
    assert!(engine.pending_approvals().is_empty());
    assert!(engine.approve(approval_id, Utc::now()).is_err());
    assert!(drain(&rx)
        .iter()
        .any(|e| matches!(e, EngineEvent::ApprovalExpired { approval_id: id, .. } if *id == approval_id)));
}

#[tokio::test]
async fn test_approving_expired_request_between_ticks_fails() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let proposer = ScriptedProposer::with_actions(vec![Action::new("wire funds", "payment")]);
    let exec = FakeExecutor::ok("primary");
    let mut engine = engine(proposer, vec![exec.clone()], &bus)
        .with_approvals(ApprovalQueue::new(chrono::Duration::minutes(5)));
    engine.add_goal(Goal::new("pay vendor", "finance"), true).unwrap();
    let stop = StopSignal::new();
    let start = Utc::now();

    engine.tick(start, &stop).await;
    let approval_id = engine.pending_approvals()[0].id;

    assert!(engine
        .approve(approval_id, start + chrono::Duration::hours(2))
        .is_err());
    assert!(engine.pending_approvals().is_empty());
    assert_eq!(engine.ready_len(), 0);
    assert!(drain(&rx)
        .iter()
        .any(|e| matches!(e, EngineEvent::ApprovalExpired { approval_id: id, .. } if *id == approval_id)));

    let report = engine.tick(start + chrono::Duration::hours(2), &stop).await;
    assert!(report.dispatched.is_none());
    assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_triggered_stop_skips_dispatch() {
    let bus = EventBus::new();
    let proposer = ScriptedProposer::with_actions(vec![Action::new("look around", "research")]);
    let exec = FakeExecutor::ok("primary");
    let mut engine = engine(proposer.clone(), vec![exec.clone()], &bus);
    engine.add_goal(Goal::new("explore", "misc"), true).unwrap();

    let stop = StopSignal::new();
    stop.trigger();
    let report = engine.tick(Utc::now(), &stop).await;
    assert!(report.dispatched.is_none());
    assert_eq!(proposer.propose_calls.load(Ordering::SeqCst), 0);
    assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_idle_tick_still_touches_activity() {
    let bus = EventBus::new();
    let mut engine = engine(ScriptedProposer::empty(), vec![FakeExecutor::ok("primary")], &bus);
    let activity = engine.activity();
    assert!(activity.snapshot().last_activity_at.is_none());

    engine.tick(Utc::now(), &StopSignal::new()).await;
    assert!(activity.snapshot().last_activity_at.is_some());
}

// ===========================================================================
// Recovery
// ===========================================================================

#[tokio::test]
async fn test_interrupted_action_is_closed_out_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work_log.jsonl");
    let action_id = uuid::Uuid::new_v4();
    {
        let mut log = WorkLog::open(&path, 100).unwrap();
        log.append(
            WorkLogEntry::new("dispatcher", "started: long job", LogStatus::Pending)
                .for_action(action_id),
        )
        .unwrap();
    }

    let bus = EventBus::new();
    let mut engine = engine(ScriptedProposer::empty(), vec![FakeExecutor::ok("primary")], &bus)
        .with_work_log(WorkLog::open(&path, 100).unwrap());

    assert_eq!(engine.recover_interrupted(), 1);
    let entries = engine.work_log().for_action(action_id);
    assert_eq!(entries.last().unwrap().status, LogStatus::Error);
    assert!(engine.work_log().unfinished_actions().is_empty());
    assert_eq!(engine.recover_interrupted(), 0);
}
