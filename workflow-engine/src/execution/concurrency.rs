// Concurrency Controller
// Concurrency groups: which in-flight runs a newly arrived run supersedes

use crate::error::GraphError;
use crate::execution::context::RunId;
use crate::execution::matrix::InstanceId;
use crate::execution::state::RunHandle;
use crate::execution::template::{CancelSetting, ConcurrencySetting};
use crate::expression::{Condition, ExprScope, ExpressionContext, Template};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A resolved concurrency group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyGroup {
    pub key: String,
    pub cancel_in_progress: bool,
}

impl ConcurrencyGroup {
    pub fn new(key: impl Into<String>, cancel_in_progress: bool) -> Self {
        Self {
            key: key.into(),
            cancel_in_progress,
        }
    }
}

#[derive(Debug, Clone)]
enum CancelPolicy {
    Fixed(bool),
    When(Condition),
}

/// A validated concurrency setting, resolved per run (or per instance)
#[derive(Debug, Clone)]
pub struct GroupSpec {
    key: Template,
    cancel: CancelPolicy,
}

impl GroupSpec {
    /// Workflow-level group: may reference run facts only
    pub fn compile_workflow(setting: &ConcurrencySetting) -> Result<Self, GraphError> {
        Self::compile("workflow", setting, &ExprScope::workflow())
    }

    /// Job-level group: run facts and the job's matrix values
    pub fn compile_job(
        job: &str,
        setting: &ConcurrencySetting,
        axes: &[String],
    ) -> Result<Self, GraphError> {
        let scope = ExprScope::job(Vec::new(), axes.iter().cloned()).without_status();
        Self::compile(&format!("job '{}'", job), setting, &scope)
    }

    fn compile(
        scope_name: &str,
        setting: &ConcurrencySetting,
        scope: &ExprScope,
    ) -> Result<Self, GraphError> {
        let invalid = |message: String| GraphError::InvalidConcurrencyGroup {
            scope: scope_name.to_string(),
            message,
        };

        if setting.group.chars().any(char::is_control) {
            return Err(invalid("group key contains control characters".to_string()));
        }

        let key = Template::compile(&setting.group, scope).map_err(|e| invalid(e.to_string()))?;
        let cancel = match &setting.cancel_in_progress {
            CancelSetting::Bool(flag) => CancelPolicy::Fixed(*flag),
            CancelSetting::Expression(src) => CancelPolicy::When(
                Condition::compile(src, scope)
                    .map_err(|e| invalid(format!("cancel-in-progress: {}", e)))?,
            ),
        };

        Ok(Self { key, cancel })
    }

    /// Group key as written, before expression substitution
    pub fn key_source(&self) -> &str {
        self.key.source()
    }

    pub fn resolve(&self, context: &ExpressionContext<'_>) -> ConcurrencyGroup {
        ConcurrencyGroup {
            key: self.key.render(context).trim().to_string(),
            cancel_in_progress: match &self.cancel {
                CancelPolicy::Fixed(flag) => *flag,
                CancelPolicy::When(condition) => condition.evaluate(context),
            },
        }
    }
}

/// Instances of an older run that a newer registration cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supersession {
    pub run_id: RunId,
    pub cancelled: Vec<InstanceId>,
}

/// Outcome of registering a run with a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The run is active for the key; older claims listed here were cancelled
    Accepted { superseded: Vec<Supersession> },
    /// A newer run already holds the key; the registering run was cancelled
    Superseded { by: RunId },
}

#[derive(Debug, Clone)]
enum ClaimScope {
    Run,
    Instances(Vec<InstanceId>),
}

#[derive(Debug, Clone)]
struct Claim {
    run: Arc<RunHandle>,
    scope: ClaimScope,
}

impl Claim {
    fn is_finished(&self) -> bool {
        match &self.scope {
            ClaimScope::Run => self.run.is_finished(),
            ClaimScope::Instances(ids) => ids
                .iter()
                .all(|id| self.run.state(id).map_or(true, |s| s.is_terminal())),
        }
    }

    fn cancel(&self, by: RunId) -> Vec<InstanceId> {
        match &self.scope {
            ClaimScope::Run => self.run.supersede(by),
            ClaimScope::Instances(ids) => self.run.cancel_instances(ids),
        }
    }
}

/// Group key to active claims. Each key is locked independently.
#[derive(Debug, Default)]
pub struct ConcurrencyController {
    active: DashMap<String, Vec<Claim>>,
}

impl ConcurrencyController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key a run is tracked under. An empty key is unique to the run, so it
    /// never collides with anything.
    pub fn effective_key(group: &ConcurrencyGroup, run_id: RunId) -> String {
        if group.key.is_empty() {
            format!("\u{0}run:{}", run_id)
        } else {
            group.key.clone()
        }
    }

    /// Register a whole run with a workflow-level group
    pub fn register(&self, run: &Arc<RunHandle>, group: &ConcurrencyGroup) -> Registration {
        self.claim(run, group, ClaimScope::Run)
    }

    /// Register some instances of a run with a job-level group
    pub fn register_instances(
        &self,
        run: &Arc<RunHandle>,
        group: &ConcurrencyGroup,
        instances: Vec<InstanceId>,
    ) -> Registration {
        self.claim(run, group, ClaimScope::Instances(instances))
    }

    fn claim(
        &self,
        run: &Arc<RunHandle>,
        group: &ConcurrencyGroup,
        scope: ClaimScope,
    ) -> Registration {
        let run_id = run.run_id();
        let key = Self::effective_key(group, run_id);
        let cancel_in_progress = group.cancel_in_progress && !group.key.is_empty();

        let mut claims = self.active.entry(key.clone()).or_default();
        claims.retain(|claim| !claim.is_finished());

        let mut superseded = Vec::new();

        if cancel_in_progress {
            let newest = claims.iter().map(|c| c.run.run_id()).max();
            if let Some(newer) = newest.filter(|&newest| newest > run_id) {
                let claim = Claim { run: Arc::clone(run), scope };
                let cancelled = claim.cancel(newer);
                info!(
                    group = %key,
                    run_id = %run_id,
                    by = %newer,
                    cancelled = cancelled.len(),
                    "late arrival superseded by newer run"
                );
                return Registration::Superseded { by: newer };
            }

            claims.retain(|claim| {
                let older = claim.run.run_id();
                if older >= run_id {
                    return true;
                }
                let cancelled = claim.cancel(run_id);
                info!(
                    group = %key,
                    run_id = %older,
                    by = %run_id,
                    cancelled = cancelled.len(),
                    "superseded in-progress run"
                );
                superseded.push(Supersession {
                    run_id: older,
                    cancelled,
                });
                false
            });
        }

        debug!(group = %key, run_id = %run_id, active = claims.len() + 1, "registered");
        claims.push(Claim {
            run: Arc::clone(run),
            scope,
        });

        Registration::Accepted { superseded }
    }

    /// Drop a run's claims on a key
    pub fn release(&self, key: &str, run_id: RunId) {
        if let Some(mut claims) = self.active.get_mut(key) {
            claims.retain(|claim| claim.run.run_id() != run_id);
        }
        self.active.remove_if(key, |_, claims| claims.is_empty());
    }

    /// Runs with unfinished claims on a key, oldest first
    pub fn active_runs(&self, key: &str) -> Vec<RunId> {
        let mut runs: Vec<RunId> = self
            .active
            .get(key)
            .map(|claims| {
                claims
                    .iter()
                    .filter(|claim| !claim.is_finished())
                    .map(|claim| claim.run.run_id())
                    .collect()
            })
            .unwrap_or_default();
        runs.sort();
        runs.dedup();
        runs
    }
}
