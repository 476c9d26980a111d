// Run Context
// Immutable per-invocation facts supplied by the event source

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing run identifier; later runs compare greater
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(u64);

impl RunId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out run ids in arrival order
#[derive(Debug)]
pub struct RunIdAllocator {
    next: AtomicU64,
}

impl RunIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> RunId {
        RunId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for RunIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Event kind that started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Manual,
    Tag,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Manual => "manual",
            TriggerKind::Tag => "tag",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(TriggerKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(TriggerKind::PullRequest),
            "manual" | "workflow_dispatch" => Ok(TriggerKind::Manual),
            "tag" => Ok(TriggerKind::Tag),
            other => Err(format!(
                "unknown trigger '{}' (expected push, pull_request, manual or tag)",
                other
            )),
        }
    }
}

/// Facts about one invocation, read-only for the lifetime of the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    run_id: RunId,
    trigger: TriggerKind,
    git_ref: String,
    default_branch: String,
    inputs: BTreeMap<String, String>,
}

impl RunContext {
    /// Short refs are qualified: `v1.2` becomes `refs/tags/v1.2` for tag
    /// triggers, anything else becomes `refs/heads/<name>`
    pub fn new(run_id: RunId, trigger: TriggerKind, git_ref: impl Into<String>) -> Self {
        let git_ref = git_ref.into();
        let git_ref = if git_ref.starts_with("refs/") {
            git_ref
        } else if trigger == TriggerKind::Tag {
            format!("refs/tags/{}", git_ref)
        } else {
            format!("refs/heads/{}", git_ref)
        };

        Self {
            run_id,
            trigger,
            git_ref,
            default_branch: "main".to_string(),
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn trigger(&self) -> TriggerKind {
        self.trigger
    }

    pub fn git_ref(&self) -> &str {
        &self.git_ref
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    pub fn input(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).map(String::as_str)
    }

    pub fn inputs(&self) -> &BTreeMap<String, String> {
        &self.inputs
    }

    /// Branch name for `refs/heads/*` refs
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    /// Tag name for `refs/tags/*` refs
    pub fn tag(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/tags/")
    }

    pub fn is_default_branch(&self) -> bool {
        self.branch() == Some(self.default_branch.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_is_monotonic() {
        let ids = RunIdAllocator::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert!(second > first);
        assert_eq!(first.get(), 1);
    }

    #[test]
    fn test_short_refs_are_qualified() {
        let push = RunContext::new(RunId::new(1), TriggerKind::Push, "feature/x");
        assert_eq!(push.git_ref(), "refs/heads/feature/x");
        assert_eq!(push.branch(), Some("feature/x"));
        assert_eq!(push.tag(), None);

        let tag = RunContext::new(RunId::new(2), TriggerKind::Tag, "v1.0");
        assert_eq!(tag.git_ref(), "refs/tags/v1.0");
        assert_eq!(tag.tag(), Some("v1.0"));
    }

    #[test]
    fn test_default_branch() {
        let ctx = RunContext::new(RunId::new(1), TriggerKind::Push, "refs/heads/trunk")
            .with_default_branch("trunk");
        assert!(ctx.is_default_branch());
    }

    #[test]
    fn test_trigger_parsing() {
        assert_eq!("workflow_dispatch".parse::<TriggerKind>(), Ok(TriggerKind::Manual));
        assert_eq!("pull-request".parse::<TriggerKind>(), Ok(TriggerKind::PullRequest));
        assert!("schedule".parse::<TriggerKind>().is_err());
    }
}
