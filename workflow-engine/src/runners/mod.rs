// Runners Module
// Task runners execute one step of a job instance on behalf of the Run Executor

pub mod scripted;
pub mod shell;

// Re-export key types
pub use scripted::{JournalEntry, ScriptedRunner};
pub use shell::{Shell, ShellRunner};

use crate::execution::context::RunId;
use crate::execution::matrix::InstanceId;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Terminal status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything a runner needs to execute one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    pub run_id: RunId,
    pub instance: InstanceId,
    pub step_index: usize,
    pub step_name: String,
    /// Command with `${{ }}` expressions already rendered
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
}

/// Result of executing a step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    /// Captured output, stdout and stderr interleaved by line
    pub output: String,
    pub error: Option<String>,
    pub duration: Duration,
}

impl StepResult {
    pub fn succeeded(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: StepStatus::Succeeded,
            exit_code: Some(0),
            output: output.into(),
            error: None,
            duration,
        }
    }

    pub fn failed(exit_code: Option<i32>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: StepStatus::Failed,
            exit_code,
            output: String::new(),
            error: Some(error.into()),
            duration,
        }
    }

    pub fn cancelled(duration: Duration) -> Self {
        Self {
            status: StepStatus::Cancelled,
            exit_code: None,
            output: String::new(),
            error: Some("cancelled".to_string()),
            duration,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

/// Callback for output lines as they are produced: `(line, is_stderr)`
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// External task runner
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute one step. Implementations stop as soon as practical once
    /// `cancel` fires and report `StepStatus::Cancelled`. No retries.
    async fn run(
        &self,
        request: &StepRequest,
        on_output: OutputCallback,
        cancel: CancellationToken,
    ) -> StepResult;
}

/// Output callback that discards everything
pub fn discard_output() -> OutputCallback {
    Arc::new(|_, _| {})
}
