//! Worker process launching.
//!
//! This module writes rendered worker sources to temp files, starts them
//! under the job's interpreter, and watches each child in a background task
//! so the supervisor can ask "has it exited, and how" without blocking.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use boostrun_core::{ExitOutcome, JobSpec};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::sentinel::remove_if_exists;

/// Log target of forwarded worker output.
///
/// Lines are logged at info level under this target, so a filter that
/// silences the rest of the crate can still enable them with
/// `boostrun::worker=info`.
pub const WORKER_OUTPUT_TARGET: &str = "boostrun::worker";

/// A rendered worker source persisted to a temp file.
///
/// The file is not removed on drop; whoever owns the worker deletes it once
/// the process is gone, and the sentinel keeps track of it until then.
#[derive(Debug, Clone)]
pub struct RenderedWorker {
    path: PathBuf,
    len: usize,
}

impl RenderedWorker {
    /// Absolute path of the source file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the rendered source in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the rendered source is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Delete the source file; a missing file is not an error.
    pub fn remove(&self) -> std::io::Result<()> {
        remove_if_exists(&self.path)
    }
}

/// Starts worker sources as child processes.
#[derive(Debug, Clone)]
pub struct Launcher {
    /// Program executing the source file.
    interpreter: String,

    /// Forward the worker's stdout/stderr lines to the log under
    /// [`WORKER_OUTPUT_TARGET`].
    forward_output: bool,

    /// Temp file name prefix.
    prefix: String,
}

impl Launcher {
    /// Create a launcher running sources with `interpreter`.
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            forward_output: false,
            prefix: "boostrun-worker-template-".to_string(),
        }
    }

    /// Launcher configured for `spec`.
    pub fn for_job(spec: &JobSpec) -> Self {
        Self::new(spec.interpreter.clone())
            .with_forward_output(spec.debug)
            .with_prefix(format!("boostrun-{}-template-", spec.workload.name()))
    }

    /// Set whether worker output is forwarded to the log.
    pub fn with_forward_output(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }

    /// Set the temp file name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Write `source` to a fresh temp file.
    pub fn write_source(&self, source: &[u8]) -> Result<RenderedWorker, SupervisorError> {
        let mut file = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempfile()
            .map_err(SupervisorError::launch("create worker source"))?;

        // Until `keep` succeeds the temp file removes itself on error.
        file.write_all(source)
            .and_then(|_| file.flush())
            .map_err(SupervisorError::launch("write worker source"))?;

        let path = file
            .into_temp_path()
            .keep()
            .map_err(|e| SupervisorError::launch("persist worker source")(e.error))?;

        debug!(path = %path.display(), bytes = source.len(), "Worker source written");

        Ok(RenderedWorker {
            path,
            len: source.len(),
        })
    }

    /// Start `worker` as a child process.
    pub fn spawn(&self, worker: &RenderedWorker) -> Result<ChildProcess, SupervisorError> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(worker.path()).stdin(Stdio::null()).kill_on_drop(true);

        if self.forward_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        debug!("Full command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            error!(interpreter = %self.interpreter, error = %e, "Failed to spawn worker process");
            SupervisorError::launch("spawn worker process")(e)
        })?;

        let pid = child.id().ok_or_else(|| {
            SupervisorError::launch("spawn worker process")(std::io::Error::other(
                "worker exited before its pid could be read",
            ))
        })?;

        info!(
            pid = pid,
            interpreter = %self.interpreter,
            source = %worker.path().display(),
            "Worker process spawned"
        );

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, pid, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, pid, "stderr");
        }

        Ok(ChildProcess::observe(child, pid))
    }

    /// Write `source` and start it, removing the temp file if the start fails.
    pub fn launch(&self, source: &[u8]) -> Result<(RenderedWorker, ChildProcess), SupervisorError> {
        let worker = self.write_source(source)?;

        match self.spawn(&worker) {
            Ok(child) => Ok((worker, child)),
            Err(e) => {
                if let Err(remove_err) = worker.remove() {
                    warn!(path = %worker.path().display(), error = %remove_err, "Failed to remove worker source");
                }
                Err(e)
            }
        }
    }
}

/// Handle to a running worker process.
///
/// A background task owns the OS child and publishes its exit outcome.
/// Dropping the handle kills the worker.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    exited: CancellationToken,
}

impl ChildProcess {
    fn observe(mut child: Child, pid: u32) -> Self {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let exited = CancellationToken::new();
        let exited_signal = exited.clone();

        tokio::spawn(async move {
            // A dropped handle also resolves `kill_rx`, so orphaned handles kill too.
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(pid = pid, error = %e, "Failed to signal worker process");
                    }
                    child.wait().await
                }
            };

            let outcome = match status {
                Ok(status) => ExitOutcome::from(status),
                Err(e) => ExitOutcome::Unknown {
                    reason: e.to_string(),
                },
            };

            info!(pid = pid, outcome = %outcome, "Worker process exited");
            exit_tx.send_replace(Some(outcome));
            exited_signal.cancel();
        });

        Self {
            pid,
            kill_tx: Some(kill_tx),
            exit_rx,
            exited,
        }
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit outcome if the process has exited, without blocking.
    pub fn try_exit(&self) -> Option<ExitOutcome> {
        (*self.exit_rx.borrow()).clone()
    }

    /// Token cancelled as soon as the process exits.
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Wait until the process exits.
    pub async fn wait(&mut self) -> ExitOutcome {
        let outcome = match self.exit_rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };

        outcome.unwrap_or_else(|| ExitOutcome::Unknown {
            reason: "exit observer stopped".to_string(),
        })
    }

    /// SIGKILL the process and wait up to `grace` for it to be reaped.
    ///
    /// Killing a process that already exited is not an error.
    pub async fn kill(&mut self, grace: Duration) -> Result<ExitOutcome, SupervisorError> {
        if let Some(tx) = self.kill_tx.take() {
            // The observer is gone only if the process already exited.
            let _ = tx.send(());
        }

        let pid = self.pid;
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(SupervisorError::Reap {
                pid,
                reason: format!("still running {:?} after SIGKILL", grace),
            }),
        }
    }
}

/// Spawn a reader that logs each line the worker writes to `stream`.
fn forward_lines<R>(reader: R, pid: u32, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        info!(target: WORKER_OUTPUT_TARGET, pid = pid, stream = stream, "{}", trimmed);
                    }
                }
                Err(e) => {
                    error!(pid = pid, stream = stream, error = %e, "Error reading worker output");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sh() -> Launcher {
        Launcher::new("sh").with_prefix("boostrun-test-")
    }

    #[test]
    fn test_launcher_for_job() {
        let spec = JobSpec::train_ensemble("/data")
            .with_interpreter("python3.11")
            .with_debug(true);
        let launcher = Launcher::for_job(&spec);

        assert_eq!(launcher.interpreter, "python3.11");
        assert!(launcher.forward_output);
        assert_eq!(launcher.prefix, "boostrun-ensemble-template-");
    }

    #[test]
    fn test_write_source() {
        let worker = sh().write_source(b"exit 0\n").unwrap();

        assert!(worker.path().is_absolute());
        assert_eq!(fs::read(worker.path()).unwrap(), b"exit 0\n");
        assert_eq!(worker.len(), 7);

        worker.remove().unwrap();
        assert!(!worker.path().exists());
        worker.remove().unwrap();
    }

    #[tokio::test]
    async fn test_observer_records_exit_code() {
        let (worker, mut child) = sh().launch(b"exit 3\n").unwrap();

        let outcome = child.wait().await;
        assert_eq!(outcome, ExitOutcome::Exited { code: 3 });
        assert_eq!(child.try_exit(), Some(outcome));
        assert!(child.exited().is_cancelled());

        worker.remove().unwrap();
    }

    #[tokio::test]
    async fn test_kill_running_process() {
        let (worker, mut child) = sh().launch(b"exec sleep 30\n").unwrap();
        assert!(child.try_exit().is_none());

        let outcome = child.kill(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, ExitOutcome::Signaled { signal: 9 });

        // Killing again is harmless.
        let again = child.kill(Duration::from_secs(5)).await.unwrap();
        assert_eq!(again, outcome);

        worker.remove().unwrap();
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_not_an_error() {
        let (worker, mut child) = sh().launch(b"exit 0\n").unwrap();
        child.wait().await;

        let outcome = child.kill(Duration::from_secs(5)).await.unwrap();
        assert!(outcome.success());

        worker.remove().unwrap();
    }

    #[tokio::test]
    async fn test_missing_interpreter_removes_source() {
        let launcher = Launcher::new("/nonexistent/interpreter").with_prefix("boostrun-missing-");
        let before = temp_entries("boostrun-missing-");

        let err = launcher.launch(b"exit 0\n").unwrap_err();
        assert!(matches!(err, SupervisorError::Launch { .. }));
        assert_eq!(temp_entries("boostrun-missing-"), before);
    }

    #[tokio::test]
    async fn test_forwarded_output_does_not_block_exit() {
        let launcher = sh().with_forward_output(true);
        let (worker, mut child) = launcher.launch(b"echo hello\necho oops >&2\nexit 0\n").unwrap();

        assert!(child.wait().await.success());
        worker.remove().unwrap();
    }

    fn temp_entries(prefix: &str) -> usize {
        fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
            .count()
    }
}
