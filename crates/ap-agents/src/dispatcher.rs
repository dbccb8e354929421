use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::EngineEvent;
use ap_core::types::{
    Action, ActionFailure, ActionResult, ActionStatus, FailureKind, TransitionError,
};
use ap_harness::executor::{Executor, ExecutorError};
use ap_harness::signal::StopSignal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::ExecutorRegistry;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Executor reported not ready; nothing was run.
    Skipped,
    Succeeded,
    Failed,
    RateLimited,
    Unavailable,
    TimedOut,
    Cancelled,
}

impl AttemptOutcome {
    /// Backend-level outcomes that hand the action to the next executor.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::RateLimited | AttemptOutcome::Unavailable | AttemptOutcome::TimedOut
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub executor: String,
    pub outcome: AttemptOutcome,
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of one `dispatch` call. `action` is in a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub action: Action,
    pub attempts: Vec<Attempt>,
    /// Attempts that failed at the backend level and moved down the chain.
    pub fallbacks: u32,
}

impl DispatchReport {
    pub fn succeeded(&self) -> bool {
        self.action.status == ActionStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher busy with action {0}")]
    Busy(Uuid),
    #[error(transparent)]
    InvalidState(#[from] TransitionError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Executes one approved action at a time across the executor chain.
///
/// Each attempt races its timeout and the abort signal. Rate limiting,
/// unavailability and timeouts fall through to the next executor; a task
/// failure or cancellation ends the dispatch. Every executor is tried at
/// most once per dispatch.
pub struct Dispatcher {
    chain: Vec<Arc<dyn Executor>>,
    default_timeout: Duration,
    in_flight: Mutex<Option<Uuid>>,
    bus: Option<EventBus>,
}

impl Dispatcher {
    pub fn new(chain: Vec<Arc<dyn Executor>>, default_timeout: Duration) -> Self {
        Self {
            chain,
            default_timeout,
            in_flight: Mutex::new(None),
            bus: None,
        }
    }

    pub fn from_registry(registry: &ExecutorRegistry, default_timeout: Duration) -> Self {
        Self::new(registry.chain(), default_timeout)
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Id of the action currently executing, if any.
    pub fn in_flight(&self) -> Option<Uuid> {
        *self.slot()
    }

    pub async fn dispatch(&self, mut action: Action, abort: &StopSignal) -> Result<DispatchReport> {
        let _guard = self.claim(action.id)?;
        action.transition(ActionStatus::Executing)?;
        info!(action_id = %action.id, title = %action.title, "dispatch started");
        self.publish(EngineEvent::ActionStarted {
            action_id: action.id,
            goal_id: action.goal_id,
            title: action.title.clone(),
        });

        let timeout = action
            .execution_plan
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut success: Option<(String, String, u64)> = None;
        let mut failure: Option<ActionFailure> = None;

        for executor in self.ordered_chain(action.execution_plan.executor_hint.as_deref()) {
            let name = executor.name().to_string();
            if abort.is_triggered() {
                failure = Some(ActionFailure::new(
                    FailureKind::Cancelled,
                    "dispatch aborted before attempt",
                ));
                break;
            }
            if !executor.is_ready().await {
                debug!(executor = %name, "executor not ready, skipping");
                attempts.push(Attempt {
                    executor: name,
                    outcome: AttemptOutcome::Skipped,
                    message: None,
                    duration_ms: 0,
                });
                continue;
            }

            let started = Instant::now();
            let result = tokio::select! {
                r = tokio::time::timeout(timeout, executor.execute(&action, timeout)) => Some(r),
                _ = abort.triggered() => None,
            };
            let elapsed = started.elapsed().as_millis() as u64;

            let (outcome, message) = match result {
                None => {
                    executor.cancel().await;
                    (AttemptOutcome::Cancelled, Some("aborted by supervisor".to_string()))
                }
                Some(Err(_)) => {
                    executor.cancel().await;
                    (
                        AttemptOutcome::TimedOut,
                        Some(format!("no result within {}ms", timeout.as_millis())),
                    )
                }
                Some(Ok(Ok(out))) => {
                    success = Some((name.clone(), out.output, elapsed));
                    (AttemptOutcome::Succeeded, None)
                }
                Some(Ok(Err(e))) => (outcome_for(&e), Some(e.to_string())),
            };

            if outcome.is_fallback() {
                warn!(action_id = %action.id, executor = %name, outcome = ?outcome, "falling back to next executor");
            }
            attempts.push(Attempt {
                executor: name,
                outcome,
                message: message.clone(),
                duration_ms: elapsed,
            });

            match outcome {
                AttemptOutcome::Succeeded => break,
                AttemptOutcome::Cancelled => {
                    failure = Some(ActionFailure::new(
                        FailureKind::Cancelled,
                        message.unwrap_or_default(),
                    ));
                    break;
                }
                AttemptOutcome::Failed => {
                    failure = Some(ActionFailure::new(
                        FailureKind::Execution,
                        message.unwrap_or_default(),
                    ));
                    break;
                }
                _ => {}
            }
        }

        let fallbacks = attempts.iter().filter(|a| a.outcome.is_fallback()).count() as u32;

        if let Some((executor, output, duration_ms)) = success {
            action.result = Some(ActionResult {
                success: true,
                output: output.clone(),
                executor: executor.clone(),
                duration_ms,
            });
            action.transition(ActionStatus::Completed)?;
            info!(action_id = %action.id, executor = %executor, fallbacks, "action completed");
            self.publish(EngineEvent::ActionCompleted {
                action_id: action.id,
                goal_id: action.goal_id,
                executor,
                output,
                duration_ms,
            });
        } else {
            let failure = match failure {
                Some(f) => f,
                // A stop that lands as the last executor falls through still cancels.
                None if abort.is_triggered() => ActionFailure::new(
                    FailureKind::Cancelled,
                    "dispatch aborted after last attempt",
                ),
                None => exhausted(&attempts),
            };
            warn!(action_id = %action.id, kind = ?failure.kind, error = %failure.message, "action failed");
            action.error = Some(failure.clone());
            action.transition(ActionStatus::Failed)?;
            self.publish(EngineEvent::ActionFailed {
                action_id: action.id,
                goal_id: action.goal_id,
                failure,
            });
        }

        Ok(DispatchReport {
            action,
            attempts,
            fallbacks,
        })
    }

    /// Chain order with the hinted executor, if known, moved to the front.
    fn ordered_chain(&self, hint: Option<&str>) -> Vec<Arc<dyn Executor>> {
        let mut chain = self.chain.clone();
        if let Some(hint) = hint {
            if let Some(pos) = chain.iter().position(|e| e.name() == hint) {
                let preferred = chain.remove(pos);
                chain.insert(0, preferred);
            }
        }
        chain
    }

    fn claim(&self, action_id: Uuid) -> Result<InFlightGuard<'_>> {
        let mut slot = self.slot();
        if let Some(current) = *slot {
            return Err(DispatchError::Busy(current));
        }
        *slot = Some(action_id);
        Ok(InFlightGuard { dispatcher: self })
    }

    fn slot(&self) -> MutexGuard<'_, Option<Uuid>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

/// Clears the in-flight slot when the dispatch finishes or is dropped.
struct InFlightGuard<'a> {
    dispatcher: &'a Dispatcher,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *self.dispatcher.slot() = None;
    }
}

fn outcome_for(err: &ExecutorError) -> AttemptOutcome {
    match err {
        ExecutorError::RateLimited { .. } => AttemptOutcome::RateLimited,
        ExecutorError::Unavailable(_) => AttemptOutcome::Unavailable,
        ExecutorError::Timeout => AttemptOutcome::TimedOut,
        ExecutorError::Failed(_) => AttemptOutcome::Failed,
        ExecutorError::Cancelled => AttemptOutcome::Cancelled,
    }
}

fn exhausted(attempts: &[Attempt]) -> ActionFailure {
    let tried: Vec<String> = attempts
        .iter()
        .filter(|a| a.outcome != AttemptOutcome::Skipped)
        .map(|a| match &a.message {
            Some(m) => format!("{}: {m}", a.executor),
            None => a.executor.clone(),
        })
        .collect();
    if tried.is_empty() {
        ActionFailure::new(FailureKind::NoExecutor, "no executor in the chain was ready")
    } else {
        ActionFailure::new(
            FailureKind::Exhausted,
            format!("all executors failed ({})", tried.join("; ")),
        )
    }
}
