use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Observed lifecycle state of an instance.
///
/// Never persisted: it is recomputed from the filesystem and the process table
/// every time it is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Working directory absent.
    Free,
    /// Working directory present, operator intent is not serving.
    Stopped,
    /// Process launched, readiness not confirmed yet.
    Starting,
    /// Ready, alive, bound and heart beating.
    Serving,
    /// Intended to serve, but some serving or starting condition is violated.
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Free => "FREE",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Serving => "SERVING",
            LifecycleState::Failed => "FAILED",
        }
    }

    /// Starting or serving: the keepalive leaves such instances alone.
    pub fn is_working(&self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Serving)
    }

    /// Free or failed while the operator wants it serving.
    pub fn needs_recovery(&self) -> bool {
        matches!(self, LifecycleState::Free | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "FREE" => Ok(LifecycleState::Free),
            "STOPPED" => Ok(LifecycleState::Stopped),
            "STARTING" => Ok(LifecycleState::Starting),
            "SERVING" => Ok(LifecycleState::Serving),
            "FAILED" => Ok(LifecycleState::Failed),
            other => Err(format!("unknown lifecycle state: {other}")),
        }
    }
}
