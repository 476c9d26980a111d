// Shell Runner
// Executes step commands in a system shell

use crate::runners::{OutputCallback, StepRequest, StepResult, StepStatus, TaskRunner};

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shell types supported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// Default shell (sh on Unix, cmd on Windows)
    Default,
    /// Bash shell, with errexit and pipefail
    Bash,
    /// PowerShell Core (cross-platform)
    Pwsh,
}

impl Shell {
    /// Prefer bash when it is on PATH
    pub fn detect() -> Self {
        if cfg!(not(target_os = "windows")) && which::which("bash").is_ok() {
            Shell::Bash
        } else {
            Shell::Default
        }
    }

    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-eo", "pipefail", "-c"]),
            Shell::Pwsh => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
        }
    }
}

/// Shell runner for executing step commands
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: Shell,
    timeout: Option<Duration>,
}

impl ShellRunner {
    /// Create a shell runner using the detected shell
    pub fn new() -> Self {
        Self {
            shell: Shell::detect(),
            timeout: None,
        }
    }

    /// Create a shell runner with a specific shell
    pub fn with_shell(shell: Shell) -> Self {
        Self {
            shell,
            timeout: None,
        }
    }

    /// Kill steps that run longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn shell(&self) -> Shell {
        self.shell
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream lines from a child pipe to the callback while collecting them
fn collect_lines<R>(reader: R, is_stderr: bool, on_output: OutputCallback) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut output = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            on_output(&line, is_stderr);
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&line);
        }
        output
    })
}

#[async_trait::async_trait]
impl TaskRunner for ShellRunner {
    async fn run(
        &self,
        request: &StepRequest,
        on_output: OutputCallback,
        cancel: CancellationToken,
    ) -> StepResult {
        let start = Instant::now();
        let (shell_cmd, shell_args) = self.shell.get_command();

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args)
            .arg(&request.command)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return StepResult::failed(
                    None,
                    format!("failed to spawn shell process '{}': {}", shell_cmd, e),
                    start.elapsed(),
                );
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return StepResult::failed(None, "shell output was not captured", start.elapsed());
        };
        let stdout_handle = collect_lines(stdout, false, on_output.clone());
        let stderr_handle = collect_lines(stderr, true, on_output);

        let timeout = async {
            match self.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let (wait_result, interrupted) = tokio::select! {
            result = child.wait() => (Some(result), None),
            _ = cancel.cancelled() => (None, Some(StepStatus::Cancelled)),
            _ = timeout => (None, Some(StepStatus::Failed)),
        };

        if interrupted.is_some() {
            debug!(instance = %request.instance, step = request.step_index, "killing step process");
            let _ = child.kill().await;
        }

        let stdout = drain(stdout_handle, interrupted.is_some()).await;
        let stderr = drain(stderr_handle, interrupted.is_some()).await;
        let output = match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout,
            (true, false) => stderr,
            (false, false) => format!("{}\n{}", stdout, stderr),
        };
        let duration = start.elapsed();

        match (interrupted, wait_result) {
            (Some(StepStatus::Cancelled), _) => StepResult::cancelled(duration).with_output(output),
            (Some(_), _) => StepResult::failed(
                None,
                format!("step timed out after {:?}", self.timeout.unwrap_or_default()),
                duration,
            )
            .with_output(output),
            (None, Some(Ok(status))) if status.success() => StepResult::succeeded(output, duration),
            (None, Some(Ok(status))) => StepResult::failed(
                status.code(),
                format!("process exited with code {}", status.code().unwrap_or(-1)),
                duration,
            )
            .with_output(output),
            (None, Some(Err(e))) => {
                StepResult::failed(None, format!("failed to wait for process: {}", e), duration)
                    .with_output(output)
            }
            (None, None) => StepResult::failed(None, "process state unknown", duration),
        }
    }
}

/// Collect a reader's output. Grandchildren of a killed shell may keep the
/// pipe open, so reads after an interruption are bounded.
async fn drain(handle: JoinHandle<String>, interrupted: bool) -> String {
    if interrupted {
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default()
    } else {
        handle.await.unwrap_or_default()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::execution::context::RunId;
    use crate::execution::matrix::InstanceId;
    use crate::runners::discard_output;

    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    fn request(command: &str) -> StepRequest {
        StepRequest {
            run_id: RunId::new(1),
            instance: InstanceId::singleton("job"),
            step_index: 0,
            step_name: "step".into(),
            command: command.into(),
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            working_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_successful_command_captures_output() {
        let runner = ShellRunner::with_shell(Shell::Default);
        let result = runner
            .run(&request("echo $GREETING"), discard_output(), CancellationToken::new())
            .await;

        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.output, "hello");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_failing_command_reports_exit_code() {
        let runner = ShellRunner::with_shell(Shell::Default);
        let result = runner
            .run(&request("exit 3"), discard_output(), CancellationToken::new())
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_output_is_streamed() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let on_output: OutputCallback = Arc::new(move |line, is_stderr| {
            sink.lock().unwrap().push((line.to_string(), is_stderr));
        });

        let runner = ShellRunner::with_shell(Shell::Default);
        runner
            .run(&request("echo out; echo err >&2"), on_output, CancellationToken::new())
            .await;

        let lines = lines.lock().unwrap();
        assert!(lines.contains(&("out".to_string(), false)));
        assert!(lines.contains(&("err".to_string(), true)));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let runner = ShellRunner::with_shell(Shell::Default);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = runner.run(&request("sleep 10"), discard_output(), cancel).await;

        assert_eq!(result.status, StepStatus::Cancelled);
        assert!(result.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_fails_step() {
        let runner =
            ShellRunner::with_shell(Shell::Default).with_timeout(Duration::from_millis(50));
        let result = runner
            .run(&request("sleep 10"), discard_output(), CancellationToken::new())
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("timed out"));
    }
}
