use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ap_agents::approval::{ApprovalError, ApprovalQueue, ApprovalRequest};
use ap_agents::dispatcher::{AttemptOutcome, DispatchError, DispatchReport, Dispatcher};
use ap_agents::goal_manager::{GoalError, GoalManager, ProgressDelta, SyncOutcome};
use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::{EngineEvent, ProposalsPayload};
use ap_core::risk::RiskClassifier;
use ap_core::types::{Action, ActionStatus, Goal, LogStatus, RiskLevel, WorkLogEntry};
use ap_core::work_log::WorkLog;
use ap_harness::proposer::{Context, ContextRegistry, ProposalError, Proposer};
use ap_harness::signal::StopSignal;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::ActivityMonitor;

/// Shortest allowed liveness heartbeat.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures of operator commands. A tick itself never fails.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Goal(#[from] GoalError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// TickReport
// ---------------------------------------------------------------------------

/// What one engine cycle did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub expired_approvals: usize,
    pub goal_id: Option<Uuid>,
    /// New goals accepted from the proposer this cycle.
    pub goals_proposed: usize,
    pub actions_proposed: usize,
    pub queued_for_approval: usize,
    pub dispatched: Option<DispatchReport>,
    /// Nothing to work on: no selectable goal and the proposer offered none.
    pub no_actionable_work: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One proposal/approval/dispatch cycle per `tick`.
///
/// Order within a tick: expire stale approvals, then (if nothing is ready to
/// run) select a goal and ask the proposer for work, then dispatch at most
/// one ready action. Auto-risk actions go straight to the ready queue;
/// manual ones wait in the approval queue and join the ready queue once
/// approved, so they run on a later tick.
pub struct Engine {
    goals: GoalManager,
    approvals: ApprovalQueue,
    classifier: RiskClassifier,
    dispatcher: Dispatcher,
    proposer: Arc<dyn Proposer>,
    context: ContextRegistry,
    work_log: WorkLog,
    ready: VecDeque<Action>,
    activity: ActivityMonitor,
    bus: EventBus,
    proposer_timeout: Duration,
    heartbeat: Duration,
}

impl Engine {
    pub fn new(goals: GoalManager, dispatcher: Dispatcher, proposer: Arc<dyn Proposer>) -> Self {
        Self {
            goals,
            approvals: ApprovalQueue::new(chrono::Duration::hours(1)),
            classifier: RiskClassifier::default(),
            dispatcher,
            proposer,
            context: ContextRegistry::new(),
            work_log: WorkLog::in_memory(1000),
            ready: VecDeque::new(),
            activity: ActivityMonitor::new(),
            bus: EventBus::new(),
            proposer_timeout: Duration::from_secs(120),
            heartbeat: Duration::from_secs(150),
        }
    }

    pub fn with_work_log(mut self, work_log: WorkLog) -> Self {
        self.work_log = work_log;
        self
    }

    pub fn with_classifier(mut self, classifier: RiskClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_approvals(mut self, approvals: ApprovalQueue) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_context(mut self, context: ContextRegistry) -> Self {
        self.context = context;
        self
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_activity(mut self, activity: ActivityMonitor) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_proposer_timeout(mut self, timeout: Duration) -> Self {
        self.proposer_timeout = timeout;
        self
    }

    /// How often activity is touched while an executor or the proposer is
    /// still working within its timeout. Keep it well under the supervisor's
    /// stall threshold.
    pub fn with_heartbeat(mut self, period: Duration) -> Self {
        self.heartbeat = period.max(MIN_HEARTBEAT);
        self
    }

    pub fn activity(&self) -> ActivityMonitor {
        self.activity.clone()
    }

    /// Close out actions that were mid-dispatch when the process last died.
    /// Returns how many were marked interrupted.
    pub fn recover_interrupted(&mut self) -> usize {
        let open = self.work_log.unfinished_actions();
        for id in &open {
            warn!(action_id = %id, "action interrupted by previous shutdown");
            self.record(
                WorkLogEntry::new("engine", "interrupted before completion", LogStatus::Error)
                    .for_action(*id),
            );
        }
        open.len()
    }

    // -- the cycle ----------------------------------------------------------

    pub async fn tick(&mut self, now: DateTime<Utc>, abort: &StopSignal) -> TickReport {
        let mut report = TickReport {
            expired_approvals: self.expire_approvals(now),
            ..TickReport::default()
        };

        if self.ready.is_empty() && !abort.is_triggered() {
            self.propose(abort, &mut report, now).await;
        }

        if !abort.is_triggered() {
            if let Some(action) = self.ready.pop_front() {
                report.dispatched = self.dispatch(action, abort).await;
            }
        }

        self.activity.touch(Utc::now());
        report
    }

    fn expire_approvals(&mut self, now: DateTime<Utc>) -> usize {
        let expired = self.approvals.expire_stale(now);
        for req in &expired {
            self.record(
                WorkLogEntry::new(
                    "approval",
                    format!("approval expired: {}", req.action.title),
                    LogStatus::Error,
                )
                .for_action(req.action.id),
            );
            self.bus.publish(EngineEvent::ApprovalExpired {
                approval_id: req.id,
                action_id: req.action.id,
            });
        }
        expired.len()
    }

    async fn propose(&mut self, abort: &StopSignal, report: &mut TickReport, now: DateTime<Utc>) {
        let goal = match self.goals.select_current_goal() {
            Ok(goal) => goal,
            Err(e) => {
                warn!(error = %e, "goal selection failed");
                return;
            }
        };
        self.activity.set_goal(goal.as_ref().map(|g| g.id));

        let Some(goal) = goal else {
            self.propose_goals(abort, report).await;
            return;
        };
        report.goal_id = Some(goal.id);

        if self.approvals.has_pending_for(goal.id) {
            debug!(goal_id = %goal.id, "goal has an action awaiting approval");
            return;
        }

        let context = self.context.snapshot_all().await;
        let proposer = self.proposer.clone();
        let actions = match self
            .bounded(abort, proposer.propose(&goal, &context))
            .await
        {
            Ok(actions) => actions,
            Err(e) => {
                warn!(goal_id = %goal.id, error = %e, "proposal failed, deferring");
                return;
            }
        };
        if actions.is_empty() {
            debug!(goal_id = %goal.id, "proposer had nothing for goal");
            return;
        }

        let mut auto = Vec::new();
        let mut awaiting = Vec::new();
        for mut action in actions {
            if action.status != ActionStatus::Proposed {
                warn!(action_id = %action.id, status = %action.status, "ignoring proposal not in proposed state");
                continue;
            }
            action.goal_id.get_or_insert(goal.id);
            action.risk = self.classifier.classify(&action);
            report.actions_proposed += 1;

            match action.risk {
                RiskLevel::Auto => {
                    if let Err(e) = action.transition(ActionStatus::Approved) {
                        warn!(error = %e, "auto approval failed");
                        continue;
                    }
                    self.record(
                        WorkLogEntry::new("engine", format!("proposed: {}", action.title), LogStatus::Info)
                            .for_action(action.id),
                    );
                    auto.push(action.id);
                    self.ready.push_back(action);
                }
                RiskLevel::Manual => {
                    let (action_id, title) = (action.id, action.title.clone());
                    match self.approvals.enqueue(action, now) {
                        Ok(approval_id) => {
                            self.record(
                                WorkLogEntry::new(
                                    "approval",
                                    format!("awaiting approval: {title}"),
                                    LogStatus::Info,
                                )
                                .for_action(action_id),
                            );
                            if let Some(req) = self.approvals.get(approval_id) {
                                self.bus.publish(EngineEvent::ApprovalRequested {
                                    approval_id,
                                    action_id,
                                    title,
                                    expires_at: req.expires_at,
                                });
                            }
                            awaiting.push(action_id);
                            report.queued_for_approval += 1;
                        }
                        Err(e) => warn!(action_id = %action_id, error = %e, "enqueue failed"),
                    }
                }
            }
        }

        info!(goal_id = %goal.id, auto = auto.len(), awaiting = awaiting.len(), "proposals updated");
        self.activity.touch(Utc::now());
        self.bus.publish(EngineEvent::ProposalsUpdated(ProposalsPayload {
            goal_id: goal.id,
            auto,
            awaiting_approval: awaiting,
        }));
    }

    async fn propose_goals(&mut self, abort: &StopSignal, report: &mut TickReport) {
        let context = self.context.snapshot_all().await;
        let proposer = self.proposer.clone();
        match self.bounded(abort, proposer.propose_goals(&context)).await {
            Ok(goals) if goals.is_empty() => {
                info!("no actionable work");
                report.no_actionable_work = true;
            }
            Ok(goals) => {
                for goal in goals {
                    let title = goal.title.clone();
                    match self.goals.add_goal(goal, false) {
                        Ok(id) => {
                            info!(goal_id = %id, title = %title, "goal proposed");
                            report.goals_proposed += 1;
                        }
                        Err(e) => warn!(error = %e, "rejected proposed goal"),
                    }
                }
                self.activity.touch(Utc::now());
            }
            Err(e) => warn!(error = %e, "goal proposal failed, deferring"),
        }
    }

    /// Await a proposer call, bounded by the proposer timeout and the abort signal.
    async fn bounded<T>(
        &self,
        abort: &StopSignal,
        call: impl std::future::Future<Output = std::result::Result<T, ProposalError>>,
    ) -> std::result::Result<T, ProposalError> {
        let call = tokio::time::timeout(self.proposer_timeout, call);
        tokio::select! {
            res = heartbeat(&self.activity, self.heartbeat, call) => {
                res.unwrap_or(Err(ProposalError::Timeout))
            }
            _ = abort.triggered() => Err(ProposalError::Other("aborted".into())),
        }
    }

    async fn dispatch(&mut self, action: Action, abort: &StopSignal) -> Option<DispatchReport> {
        let (action_id, title) = (action.id, action.title.clone());
        self.activity.set_action(Some(action_id));
        self.record(
            WorkLogEntry::new("dispatcher", format!("started: {title}"), LogStatus::Pending)
                .for_action(action_id),
        );

        let retry = action.clone();
        let result = heartbeat(
            &self.activity,
            self.heartbeat,
            self.dispatcher.dispatch(action, abort),
        )
        .await;
        self.activity.set_action(None);
        self.activity.touch(Utc::now());

        let report = match result {
            Ok(report) => report,
            Err(DispatchError::Busy(current)) => {
                warn!(action_id = %action_id, busy_with = %current, "dispatcher busy");
                self.record(
                    WorkLogEntry::new("dispatcher", "dispatcher busy, requeued", LogStatus::Info)
                        .for_action(action_id),
                );
                self.ready.push_front(retry);
                return None;
            }
            Err(e) => {
                warn!(action_id = %action_id, error = %e, "dispatch refused");
                self.record(
                    WorkLogEntry::new("dispatcher", format!("refused: {e}"), LogStatus::Error)
                        .for_action(action_id),
                );
                return None;
            }
        };

        for attempt in report.attempts.iter().filter(|a| a.outcome.is_fallback()) {
            self.record(
                WorkLogEntry::new(
                    "dispatcher",
                    format!(
                        "fallback from {} ({})",
                        attempt.executor,
                        attempt.message.as_deref().unwrap_or(outcome_label(attempt.outcome))
                    ),
                    LogStatus::Info,
                )
                .for_action(action_id),
            );
        }

        let action = &report.action;
        if report.succeeded() {
            let executor = action
                .result
                .as_ref()
                .map(|r| r.executor.as_str())
                .unwrap_or("unknown");
            self.record(
                WorkLogEntry::new(
                    "dispatcher",
                    format!("completed via {executor}: {title}"),
                    LogStatus::Success,
                )
                .for_action(action_id),
            );
            if let Some(goal_id) = action.goal_id {
                if action.progress_weight > 0.0 {
                    self.credit(goal_id, action_id, action.progress_weight);
                }
            }
        } else {
            let message = action
                .error
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "failed".to_string());
            self.record(
                WorkLogEntry::new("dispatcher", format!("failed: {message}"), LogStatus::Error)
                    .for_action(action_id),
            );
        }
        Some(report)
    }

    fn credit(&mut self, goal_id: Uuid, action_id: Uuid, weight: f64) {
        match self
            .goals
            .sync_progress(goal_id, ProgressDelta::new(action_id.to_string(), weight))
        {
            Ok(outcome) if outcome.completed => {
                self.record(WorkLogEntry::new(
                    "goals",
                    format!("goal {goal_id} completed"),
                    LogStatus::Success,
                ));
            }
            Ok(_) => {}
            Err(e) => warn!(goal_id = %goal_id, error = %e, "progress sync failed"),
        }
    }

    // -- operator commands --------------------------------------------------

    /// Approve a pending request; the action runs on the next tick. Requests past their expiry are swept first,
    /// so approving one of them fails with `NotFound`.
    pub fn approve(&mut self, approval_id: Uuid, now: DateTime<Utc>) -> Result<Action> {
        self.expire_approvals(now);
        let action = self.approvals.approve(approval_id, now)?;
        self.record(
            WorkLogEntry::new("approval", format!("approved: {}", action.title), LogStatus::Info)
                .for_action(action.id),
        );
        self.ready.push_back(action.clone());
        Ok(action)
    }

    pub fn reject(&mut self, approval_id: Uuid, now: DateTime<Utc>) -> Result<Action> {
        self.expire_approvals(now);
        let action = self.approvals.reject(approval_id, now)?;
        self.record(
            WorkLogEntry::new("approval", format!("rejected: {}", action.title), LogStatus::Error)
                .for_action(action.id),
        );
        Ok(action)
    }

    pub fn add_goal(&mut self, goal: Goal, auto_activate: bool) -> Result<Uuid> {
        Ok(self.goals.add_goal(goal, auto_activate)?)
    }

    pub fn sync_progress(&mut self, goal_id: Uuid, delta: ProgressDelta) -> Result<SyncOutcome> {
        Ok(self.goals.sync_progress(goal_id, delta)?)
    }

    pub fn goals(&self) -> &GoalManager {
        &self.goals
    }

    pub fn goals_mut(&mut self) -> &mut GoalManager {
        &mut self.goals
    }

    pub fn pending_approvals(&self) -> &[ApprovalRequest] {
        self.approvals.pending()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn work_log(&self) -> &WorkLog {
        &self.work_log
    }

    /// Context as the proposer would see it right now.
    pub async fn context_snapshot(&self) -> Context {
        self.context.snapshot_all().await
    }

    fn record(&mut self, entry: WorkLogEntry) {
        if let Err(e) = self.work_log.append(entry) {
            warn!(error = %e, "work log write failed");
        }
    }
}

fn outcome_label(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Skipped => "skipped",
        AttemptOutcome::Succeeded => "succeeded",
        AttemptOutcome::Failed => "failed",
        AttemptOutcome::RateLimited => "rate limited",
        AttemptOutcome::Unavailable => "unavailable",
        AttemptOutcome::TimedOut => "timed out",
        AttemptOutcome::Cancelled => "cancelled",
    }
}

/// Drive `work` to completion, touching `activity` every `period` meanwhile.
///
/// Runs on the caller's task, so an executor that blocks the thread also
/// silences the heartbeat and still reads as a stall.
async fn heartbeat<F: std::future::Future>(
    activity: &ActivityMonitor,
    period: Duration,
    work: F,
) -> F::Output {
    tokio::pin!(work);
    let mut beat = tokio::time::interval(period);
    beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            out = &mut work => return out,
            _ = beat.tick() => activity.touch(Utc::now()),
        }
    }
}
