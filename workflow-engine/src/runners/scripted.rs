// Scripted Runner
// Deterministic task runner for dry runs and tests: outcomes are configured, not executed

use crate::execution::matrix::InstanceId;
use crate::runners::{OutputCallback, StepRequest, StepResult, StepStatus, TaskRunner};

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One recorded runner call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Started {
        instance: InstanceId,
        step_index: usize,
        at: Instant,
    },
    Finished {
        instance: InstanceId,
        step_index: usize,
        status: StepStatus,
        at: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Fail,
    Hang,
}

/// Runner that never spawns processes
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    by_template: HashMap<String, Script>,
    by_instance: HashMap<InstanceId, Script>,
    failing_steps: HashSet<(String, usize)>,
    delay: Option<Duration>,
    journal: Mutex<Vec<JournalEntry>>,
}

impl ScriptedRunner {
    /// Every step succeeds immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Every step of every instance of `template` fails
    pub fn fail_job(mut self, template: impl Into<String>) -> Self {
        self.by_template.insert(template.into(), Script::Fail);
        self
    }

    /// Every step of one instance fails
    pub fn fail_instance(mut self, instance: InstanceId) -> Self {
        self.by_instance.insert(instance, Script::Fail);
        self
    }

    /// One step of `template` fails
    pub fn fail_step(mut self, template: impl Into<String>, step_index: usize) -> Self {
        self.failing_steps.insert((template.into(), step_index));
        self
    }

    /// Steps of `template` run until cancelled
    pub fn hang_job(mut self, template: impl Into<String>) -> Self {
        self.by_template.insert(template.into(), Script::Hang);
        self
    }

    /// Every step takes `delay` (still honouring cancellation)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn journal_mut(&self) -> MutexGuard<'_, Vec<JournalEntry>> {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal_mut().clone()
    }

    /// Instances that had at least one step started, in start order
    pub fn started_instances(&self) -> Vec<InstanceId> {
        let mut seen = Vec::new();
        for entry in self.journal_mut().iter() {
            if let JournalEntry::Started { instance, .. } = entry {
                if !seen.contains(instance) {
                    seen.push(instance.clone());
                }
            }
        }
        seen
    }

    /// When the first step of an instance started
    pub fn started_at(&self, instance: &InstanceId) -> Option<Instant> {
        self.journal_mut().iter().find_map(|entry| match entry {
            JournalEntry::Started { instance: i, at, .. } if i == instance => Some(*at),
            _ => None,
        })
    }

    /// When the last step of an instance finished
    pub fn finished_at(&self, instance: &InstanceId) -> Option<Instant> {
        self.journal_mut().iter().rev().find_map(|entry| match entry {
            JournalEntry::Finished { instance: i, at, .. } if i == instance => Some(*at),
            _ => None,
        })
    }

    fn script_for(&self, request: &StepRequest) -> Option<Script> {
        let template = request.instance.template().to_string();
        self.by_instance
            .get(&request.instance)
            .or_else(|| self.by_template.get(&template))
            .copied()
            .or_else(|| {
                self.failing_steps
                    .contains(&(template, request.step_index))
                    .then_some(Script::Fail)
            })
    }

    fn record(&self, entry: JournalEntry) {
        self.journal_mut().push(entry);
    }
}

#[async_trait::async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(
        &self,
        request: &StepRequest,
        on_output: OutputCallback,
        cancel: CancellationToken,
    ) -> StepResult {
        let start = Instant::now();
        self.record(JournalEntry::Started {
            instance: request.instance.clone(),
            step_index: request.step_index,
            at: start,
        });

        let script = self.script_for(request);
        let wait = async {
            match (script, self.delay) {
                (Some(Script::Hang), _) => std::future::pending::<()>().await,
                (_, Some(delay)) => tokio::time::sleep(delay).await,
                _ => {}
            }
        };

        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = wait => false,
        };

        let result = if cancelled {
            StepResult::cancelled(start.elapsed())
        } else if script == Some(Script::Fail) {
            on_output(&format!("[scripted] {} failed", request.step_name), true);
            StepResult::failed(Some(1), "scripted failure", start.elapsed())
        } else {
            let line = format!("[dry-run] {}", request.command);
            on_output(&line, false);
            StepResult::succeeded(line, start.elapsed())
        };

        self.record(JournalEntry::Finished {
            instance: request.instance.clone(),
            step_index: request.step_index,
            status: result.status,
            at: Instant::now(),
        });
        result
    }
}
