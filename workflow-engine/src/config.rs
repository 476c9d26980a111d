// Engine Configuration
// Tunables for scheduling: parallelism and dependency pairing

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

/// How instances of a dependency template satisfy a dependent instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyMode {
    /// Every instance of the dependency template must be terminal and satisfy
    /// the edge
    #[default]
    FanIn,
    /// Only dependency instances whose bindings agree with the dependent on
    /// shared matrix axes are considered
    FanOut,
}

impl fmt::Display for DependencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyMode::FanIn => write!(f, "fan-in"),
            DependencyMode::FanOut => write!(f, "fan-out"),
        }
    }
}

impl FromStr for DependencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fan-in" | "fanin" => Ok(DependencyMode::FanIn),
            "fan-out" | "fanout" => Ok(DependencyMode::FanOut),
            other => Err(format!(
                "unknown dependency mode '{}' (expected fan-in or fan-out)",
                other
            )),
        }
    }
}

/// Configuration for the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Maximum simultaneously running instances per run (0 = unlimited)
    pub max_parallel: usize,
    /// Dependency pairing between matrix instances
    pub dependency_mode: DependencyMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            dependency_mode: DependencyMode::FanIn,
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_dependency_mode(mut self, mode: DependencyMode) -> Self {
        self.dependency_mode = mode;
        self
    }

    /// Whether another instance may start given the current running count
    pub fn allows(&self, running: usize) -> bool {
        self.max_parallel == 0 || running < self.max_parallel
    }
}
