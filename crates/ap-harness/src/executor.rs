//! Executor abstraction.
//!
//! An [`Executor`] is a backend that carries out an action's execution plan.
//! The dispatcher tries executors in chain order and uses the error variant
//! to decide whether to fall back:
//!
//! - [`RateLimited`](ExecutorError::RateLimited),
//!   [`Unavailable`](ExecutorError::Unavailable) and
//!   [`Timeout`](ExecutorError::Timeout) are backend-level: the next
//!   executor in the chain gets a turn.
//! - [`Failed`](ExecutorError::Failed) means the task itself failed; the
//!   chain stops there.
//! - [`Cancelled`](ExecutorError::Cancelled) is reported after a supervisor
//!   stop aborted the attempt.

use std::time::Duration;

use ap_core::types::Action;
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// The backend refused the request because of rate limits.
    #[error("rate limited{}", retry_hint(.retry_after_ms))]
    RateLimited {
        /// Delay suggested by the backend, when it gives one.
        retry_after_ms: Option<u64>,
    },

    /// The backend could not be reached or is not set up.
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    /// The attempt did not finish before its deadline.
    #[error("execution timed out")]
    Timeout,

    /// The task ran and failed.
    #[error("execution failed: {0}")]
    Failed(String),

    #[error("execution cancelled")]
    Cancelled,
}

fn retry_hint(retry_after_ms: &Option<u64>) -> String {
    match retry_after_ms {
        Some(ms) => format!(" (retry after {ms}ms)"),
        None => String::new(),
    }
}

impl ExecutorError {
    /// Returns `true` when the dispatcher should move on to the next executor.
    pub fn falls_back(&self) -> bool {
        matches!(
            self,
            ExecutorError::RateLimited { .. } | ExecutorError::Unavailable(_) | ExecutorError::Timeout
        )
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// What a successful attempt produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionOutput {
    pub output: String,
}

impl ExecutionOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A backend capable of executing actions.
///
/// Implementations must be cheap to share (`Arc<dyn Executor>`) and must
/// tolerate `cancel()` being called when nothing is in flight.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Stable name used in chain configuration and logs.
    fn name(&self) -> &str;

    /// Whether the backend can take work right now. A `false` answer makes
    /// the dispatcher skip this executor without counting it as a failure.
    async fn is_ready(&self) -> bool;

    /// Run `action`. `timeout` is the budget for this attempt; the dispatcher
    /// enforces it independently, so implementations may use it only as a hint.
    async fn execute(&self, action: &Action, timeout: Duration) -> Result<ExecutionOutput>;

    /// Abort the in-flight `execute`, if any.
    async fn cancel(&self);
}

// ---------------------------------------------------------------------------
// StubExecutor
// ---------------------------------------------------------------------------

/// An executor that is never ready.
///
/// Stands in for a configured backend that has not been wired up yet, so a
/// chain can name it without breaking dispatch.
#[derive(Debug, Clone)]
pub struct StubExecutor {
    name: String,
    reason: String,
}

impl StubExecutor {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Executor for StubExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_ready(&self) -> bool {
        false
    }

    async fn execute(&self, _action: &Action, _timeout: Duration) -> Result<ExecutionOutput> {
        let reason = if self.reason.is_empty() {
            "stub executor".to_string()
        } else {
            self.reason.clone()
        };
        Err(ExecutorError::Unavailable(reason))
    }

    async fn cancel(&self) {}
}
