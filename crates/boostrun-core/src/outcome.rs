//! Exit outcomes of worker processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

use crate::RunId;

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// The process exited on its own with this status code.
    Exited { code: i32 },
    /// The process was terminated by this signal.
    Signaled { signal: i32 },
    /// Waiting on the process failed, so nothing is known about its exit.
    Unknown { reason: String },
}

impl ExitOutcome {
    /// Returns true only for a normal exit with status 0.
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    /// Exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => Some(*code),
            _ => None,
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited { code };
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled { signal };
            }
        }

        Self::Unknown {
            reason: status.to_string(),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exit code {}", code),
            Self::Signaled { signal } => write!(f, "signal {}", signal),
            Self::Unknown { reason } => write!(f, "unknown exit ({})", reason),
        }
    }
}

/// Result of a batch (training) run.
///
/// The supervisor does not read the result artifact; it only reports where
/// the worker was expected to write it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Identifier of this run.
    pub run_id: RunId,

    /// How the worker process ended.
    pub exit: ExitOutcome,

    /// Location of the JSON result document written by the worker.
    pub result_path: PathBuf,

    /// When the worker process was started.
    pub started_at: DateTime<Utc>,

    /// When the worker process was observed to exit.
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    /// Wall-clock duration of the run in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Returns true if the result artifact exists on disk.
    pub fn has_result(&self) -> bool {
        self.result_path.is_file()
    }
}
