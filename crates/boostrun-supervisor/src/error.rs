//! Error types for worker supervision.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use boostrun_core::{ConfigError, ExitOutcome, Mode};
use thiserror::Error;

/// Errors that can occur while supervising a worker.
///
/// Everything except [`SupervisorError::Cleanup`] leaves the data root in a
/// state the next `restore`/`train`/`cleanup` call reconciles on its own.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The job spec is incomplete. Nothing was touched.
    #[error("invalid job spec: {0}")]
    Configuration(#[from] ConfigError),

    /// The worker template could not be rendered. Nothing was touched.
    #[error("failed to render worker template: {0}")]
    Template(#[from] handlebars::RenderError),

    /// The temp source file or the worker process could not be created.
    #[error("failed to launch worker ({context}): {source}")]
    Launch {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The worker never answered its health check.
    #[error("worker at {endpoint} not ready after {waited:?}")]
    ReadinessTimeout { endpoint: String, waited: Duration },

    /// The worker process exited while its health check was being polled.
    #[error("worker exited before becoming ready ({outcome})")]
    WorkerExited { outcome: ExitOutcome },

    /// `exchange` was called before `restore` completed.
    #[error("worker is not ready; restore has not completed")]
    NotReady,

    /// The worker could not be reached or did not answer in time.
    #[error("request to worker failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The worker answered with something other than a scalar prediction.
    #[error("unexpected worker response: {0}")]
    Protocol(String),

    /// A recorded process could not be terminated.
    #[error("failed to reap process {pid}: {reason}")]
    Reap { pid: u32, reason: String },

    /// The batch worker exited unsuccessfully.
    #[error("worker run failed with {exit}")]
    Run { exit: ExitOutcome },

    /// The batch worker exceeded its run timeout and was killed.
    #[error("worker run exceeded {limit:?} and was killed")]
    RunTimeout { limit: Duration },

    /// Another supervisor holds the lock for this data root.
    #[error("data root is in use by another supervisor (lock {path})")]
    DataRootBusy { path: PathBuf },

    /// A sentinel or lock file could not be read or written.
    #[error("sentinel {path}: {source}")]
    Sentinel {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A sentinel file exists but its content is unusable.
    #[error("corrupt sentinel {path}: {reason}")]
    CorruptSentinel { path: PathBuf, reason: String },

    /// Teardown left something behind; the listed artifacts need attention.
    #[error("cleanup incomplete: {}", CleanupFailure::join(.failures))]
    Cleanup {
        #[source]
        cause: Option<Box<SupervisorError>>,
        failures: Vec<CleanupFailure>,
    },

    /// The operation does not exist for this job's lifecycle mode.
    #[error("operation requires {expected:?} mode but the job runs in {actual:?} mode")]
    ModeMismatch { expected: Mode, actual: Mode },
}

impl SupervisorError {
    pub(crate) fn launch(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Launch { context, source }
    }

    pub(crate) fn sentinel(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Sentinel { path, source }
    }

    /// Wrap `self` with cleanup failures that happened while handling it.
    pub(crate) fn with_failures(self, failures: Vec<CleanupFailure>) -> Self {
        if failures.is_empty() {
            self
        } else {
            Self::Cleanup {
                cause: Some(Box::new(self)),
                failures,
            }
        }
    }

    /// Returns true if a worker or its artifacts may have been left behind.
    ///
    /// All other errors either happened before anything was started or were
    /// fully cleaned up before being returned.
    pub fn needs_intervention(&self) -> bool {
        matches!(self, Self::Cleanup { .. })
    }

    /// Cleanup failures carried by this error, if any.
    pub fn cleanup_failures(&self) -> &[CleanupFailure] {
        match self {
            Self::Cleanup { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// One teardown step that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// What was being cleaned up, e.g. a file path or `pid 4242`.
    pub target: String,

    /// Why it failed.
    pub reason: String,
}

impl CleanupFailure {
    pub(crate) fn new(target: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    fn join(failures: &[CleanupFailure]) -> String {
        failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.reason)
    }
}
