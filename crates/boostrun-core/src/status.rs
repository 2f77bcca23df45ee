//! Lifecycle states of a supervisor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a supervisor is in its lifecycle.
///
/// Serving mode walks `Idle → Cleaning → Launching → AwaitingReady → Serving
/// → Terminating → Idle`. Batch mode walks `Idle → Cleaning → Launching →
/// Running → Done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorState {
    /// No worker is owned by this supervisor.
    #[default]
    Idle,
    /// Reconciling sentinel state left behind by an earlier supervisor.
    Cleaning,
    /// Writing the worker source and starting the process.
    Launching,
    /// Serving worker started, polling its health check.
    AwaitingReady,
    /// Serving worker answered the health check and accepts exchanges.
    Serving,
    /// Batch worker running to completion.
    Running,
    /// Killing the worker and removing its artifacts.
    Terminating,
    /// Batch worker finished (successfully or not) and was cleaned up.
    Done,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Cleaning => "cleaning",
            Self::Launching => "launching",
            Self::AwaitingReady => "awaiting_ready",
            Self::Serving => "serving",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_idle() {
        assert_eq!(SupervisorState::default(), SupervisorState::Idle);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(SupervisorState::AwaitingReady.to_string(), "awaiting_ready");
        assert_eq!(SupervisorState::Done.to_string(), "done");
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&SupervisorState::AwaitingReady).unwrap();
        assert_eq!(json, "\"AWAITING_READY\"");
    }
}
