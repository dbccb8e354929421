use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use ap_core::types::Action;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::executor::{ExecutionOutput, Executor, ExecutorError, Result};

/// Runs each action as a local child process.
///
/// With a fixed `program`, the action is written to the child's stdin as
/// JSON. Without one, the program comes from the plan payload:
/// `{"program": "...", "args": ["..."]}`. Exit code 0 is success; the
/// optional rate-limited/unavailable codes map to the matching backend
/// errors and everything else is a task failure carrying stderr.
#[derive(Debug)]
pub struct CommandExecutor {
    name: String,
    program: Option<String>,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    rate_limited_exit_code: Option<i32>,
    unavailable_exit_code: Option<i32>,
    cancel: Notify,
}

impl CommandExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: None,
            args: Vec::new(),
            working_dir: None,
            rate_limited_exit_code: None,
            unavailable_exit_code: None,
            cancel: Notify::new(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = Some(program.into());
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_exit_codes(mut self, rate_limited: Option<i32>, unavailable: Option<i32>) -> Self {
        self.rate_limited_exit_code = rate_limited;
        self.unavailable_exit_code = unavailable;
        self
    }

    /// Program, args, and stdin bytes for this action.
    fn invocation(&self, action: &Action) -> Result<(String, Vec<String>, Option<Vec<u8>>)> {
        if let Some(program) = &self.program {
            let stdin = serde_json::to_vec(action)
                .map_err(|e| ExecutorError::Failed(format!("encode action: {e}")))?;
            return Ok((program.clone(), self.args.clone(), Some(stdin)));
        }

        let payload = &action.execution_plan.payload;
        let program = payload
            .get("program")
            .and_then(|p| p.as_str())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ExecutorError::Failed("plan payload has no `program`".into()))?;
        let mut args = self.args.clone();
        if let Some(extra) = payload.get("args").and_then(|a| a.as_array()) {
            args.extend(extra.iter().filter_map(|a| a.as_str().map(str::to_string)));
        }
        let stdin = payload
            .get("stdin")
            .and_then(|s| s.as_str())
            .map(|s| s.as_bytes().to_vec());
        Ok((program.to_string(), args, stdin))
    }

    fn classify_exit(&self, code: Option<i32>, stderr: &str) -> ExecutorError {
        match code {
            Some(c) if Some(c) == self.rate_limited_exit_code => {
                ExecutorError::RateLimited { retry_after_ms: None }
            }
            Some(c) if Some(c) == self.unavailable_exit_code => {
                ExecutorError::Unavailable(first_line(stderr, "backend unavailable"))
            }
            Some(c) => ExecutorError::Failed(format!(
                "exit code {c}: {}",
                first_line(stderr, "no stderr")
            )),
            None => ExecutorError::Failed("terminated by signal".into()),
        }
    }
}

fn first_line(text: &str, fallback: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_ready(&self) -> bool {
        match &self.program {
            Some(p) if Path::new(p).is_absolute() => Path::new(p).exists(),
            _ => true,
        }
    }

    async fn execute(&self, action: &Action, timeout: Duration) -> Result<ExecutionOutput> {
        let (program, args, stdin) = self.invocation(action)?;
        let start = Instant::now();

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .env("AUTOPILOT_ACTION_ID", action.id.to_string())
            .env("AUTOPILOT_ACTION_TYPE", &action.action_type)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutorError::Unavailable(format!("{program}: not found"))
            } else {
                ExecutorError::Failed(format!("spawn {program}: {e}"))
            }
        })?;
        debug!(executor = %self.name, program = %program, action_id = %action.id, "child spawned");

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            if let Err(e) = pipe.write_all(&bytes).await {
                warn!(executor = %self.name, error = %e, "failed to write child stdin");
            }
            // Dropping the pipe closes stdin so the child sees EOF.
        }

        // Dropping the `wait_with_output` future kills the child (`kill_on_drop`).
        let output = tokio::select! {
            out = tokio::time::timeout(timeout, child.wait_with_output()) => match out {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(ExecutorError::Failed(format!("wait {program}: {e}"))),
                Err(_) => return Err(ExecutorError::Timeout),
            },
            _ = self.cancel.notified() => return Err(ExecutorError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!(
            executor = %self.name,
            code = ?output.status.code(),
            duration_ms = start.elapsed().as_millis() as u64,
            "child exited"
        );

        if output.status.success() {
            Ok(ExecutionOutput::new(stdout))
        } else {
            Err(self.classify_exit(output.status.code(), &stderr))
        }
    }

    async fn cancel(&self) {
        self.cancel.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use ap_core::types::ExecutionPlan;
    use serde_json::json;
    use std::sync::Arc;

    fn shell_action(script: &str) -> Action {
        Action::new("run", "analysis").with_plan(ExecutionPlan {
            payload: json!({"program": "sh", "args": ["-c", script]}),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn successful_command_returns_stdout() {
        let exec = CommandExecutor::new("shell");
        let out = exec
            .execute(&shell_action("echo hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.output, "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_task_failure() {
        let exec = CommandExecutor::new("shell");
        let err = exec
            .execute(&shell_action("echo broken >&2; exit 3"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::Failed("exit code 3: broken".into()));
        assert!(!err.falls_back());
    }

    #[tokio::test]
    async fn configured_exit_codes_map_to_backend_errors() {
        let exec = CommandExecutor::new("shell").with_exit_codes(Some(75), Some(69));
        let limited = exec
            .execute(&shell_action("exit 75"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(limited, ExecutorError::RateLimited { .. }));
        let down = exec
            .execute(&shell_action("exit 69"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(down, ExecutorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let exec = CommandExecutor::new("shell");
        let err = exec
            .execute(&shell_action("sleep 5"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::Timeout);
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let exec = CommandExecutor::new("shell");
        let action = Action::new("run", "analysis").with_plan(ExecutionPlan {
            payload: json!({"program": "/definitely/not/here"}),
            ..Default::default()
        });
        let err = exec.execute(&action, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn fixed_program_receives_action_on_stdin() {
        let exec = CommandExecutor::new("cat").with_program("cat", Vec::new());
        let action = Action::new("echo me", "research");
        let out = exec.execute(&action, Duration::from_secs(5)).await.unwrap();
        let echoed: Action = serde_json::from_str(&out.output).unwrap();
        assert_eq!(echoed.id, action.id);
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_command() {
        let exec = Arc::new(CommandExecutor::new("shell"));
        let running = {
            let exec = exec.clone();
            tokio::spawn(async move {
                exec.execute(&shell_action("sleep 5"), Duration::from_secs(10))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        exec.cancel().await;
        let res = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("execute returned")
            .unwrap();
        assert_eq!(res.unwrap_err(), ExecutorError::Cancelled);
    }

    #[tokio::test]
    async fn absolute_missing_program_is_not_ready() {
        let exec = CommandExecutor::new("agent").with_program("/no/such/agent", Vec::new());
        assert!(!exec.is_ready().await);
        assert!(CommandExecutor::new("shell").is_ready().await);
    }
}
