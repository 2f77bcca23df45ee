//! Lifecycle control of one supervised worker.
//!
//! A [`Supervisor`] drives a single worker per data root through its
//! lifecycle. Serving workers go `Idle → Launching → AwaitingReady → Serving
//! → Terminating → Idle`; batch workers go `Idle → Cleaning → Launching →
//! Running → Done`. Both modes first reconcile whatever an earlier,
//! possibly crashed, supervisor left behind in the sentinel store.

use boostrun_core::{
    ExchangeRequest, ExitOutcome, JobSpec, Mode, RunId, RunOutcome, SupervisorState,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{CleanupFailure, SupervisorError};
use crate::exchange::ExchangeClient;
use crate::launcher::{ChildProcess, Launcher, RenderedWorker};
use crate::probe::{ProbeOutcome, ReadinessProber};
use crate::reap::reap_orphan;
use crate::sentinel::{remove_if_exists, DataRootLock, SentinelRecord, SentinelStore};
use crate::template;

/// What reconciliation does with a leftover sentinel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Kill and reap a recorded pid. Also decides whether launched workers
    /// get their pid recorded.
    pub reap_pid: bool,

    /// Delete a recorded source file.
    pub remove_source: bool,
}

impl ReconcilePlan {
    /// Default plan for `mode`.
    ///
    /// Serving workers outlive a crashed supervisor, so their pid is tracked
    /// and reaped. Batch workers only leave their source file behind.
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Serving => Self {
                reap_pid: true,
                remove_source: true,
            },
            Mode::Batch => Self {
                reap_pid: false,
                remove_source: true,
            },
        }
    }
}

/// A worker started by this supervisor.
#[derive(Debug)]
struct ManagedWorker {
    run_id: RunId,
    rendered: RenderedWorker,
    child: ChildProcess,
    started_at: DateTime<Utc>,
}

/// Supervises the worker of one [`JobSpec`].
///
/// Operations take `&mut self`, so a `restore` or `train` always completes
/// before anything else runs on the same supervisor. To exchange while
/// another task tears the worker down, clone the client returned by
/// [`Supervisor::exchange_client`].
///
/// Dropping a supervisor kills its worker but leaves the source file and
/// sentinel behind; the next supervisor for the data root reconciles them.
#[derive(Debug)]
pub struct Supervisor {
    spec: JobSpec,
    plan: ReconcilePlan,
    store: SentinelStore,
    launcher: Launcher,
    state: SupervisorState,
    lock: Option<DataRootLock>,
    worker: Option<ManagedWorker>,
    client: Option<ExchangeClient>,
}

impl Supervisor {
    /// Create a supervisor for `spec`. Nothing is touched until an operation runs.
    pub fn new(spec: JobSpec) -> Result<Self, SupervisorError> {
        spec.validate()?;

        Ok(Self {
            plan: ReconcilePlan::for_mode(spec.mode()),
            store: SentinelStore::for_job(&spec),
            launcher: Launcher::for_job(&spec),
            spec,
            state: SupervisorState::Idle,
            lock: None,
            worker: None,
            client: None,
        })
    }

    /// The supervised job.
    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Pid of the running worker, if this supervisor owns one.
    pub fn pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|w| w.child.pid())
    }

    /// Rendered source of the running worker, if this supervisor owns one.
    pub fn source_path(&self) -> Option<&std::path::Path> {
        self.worker.as_ref().map(|w| w.rendered.path())
    }

    /// Sentinel store of the data root.
    pub fn store(&self) -> &SentinelStore {
        &self.store
    }

    /// Client for the ready worker, if `restore` has completed.
    pub fn exchange_client(&self) -> Option<&ExchangeClient> {
        self.client.as_ref()
    }

    /// Reconcile leftovers, start a fresh serving worker and wait until it is ready.
    ///
    /// A worker already owned by this supervisor is shut down first. On
    /// failure after launch the new worker is killed and its artifacts are
    /// removed before the error is returned.
    pub async fn restore(&mut self) -> Result<(), SupervisorError> {
        self.require_mode(Mode::Serving)?;

        // Config and template errors must surface before anything on disk changes.
        let source = template::render(&self.spec)?;

        if self.worker.is_some() {
            info!("Replacing running worker");
            self.shutdown().await?;
        }
        self.client = None;

        self.lock_data_root()?;
        self.set_state(SupervisorState::Cleaning);
        if let Err(e) = self.reconcile().await {
            self.release(SupervisorState::Idle);
            return Err(e);
        }

        self.set_state(SupervisorState::Launching);
        let worker = match self.start(&source).await {
            Ok(worker) => worker,
            Err(e) => {
                self.release(SupervisorState::Idle);
                return Err(e);
            }
        };

        self.set_state(SupervisorState::AwaitingReady);
        match self.await_ready(&worker).await {
            Ok(client) => {
                info!(
                    run_id = %worker.run_id,
                    pid = worker.child.pid(),
                    endpoint = %client.endpoint(),
                    "Worker serving"
                );
                self.worker = Some(worker);
                self.client = Some(client);
                self.set_state(SupervisorState::Serving);
                Ok(())
            }
            Err(e) => {
                warn!(run_id = %worker.run_id, error = %e, "Worker failed to become ready");
                let failures = self.stop(worker).await;
                self.release(SupervisorState::Idle);
                Err(e.with_failures(failures))
            }
        }
    }

    /// Send one prediction request to the ready worker.
    pub async fn exchange(&self, request: &ExchangeRequest) -> Result<f32, SupervisorError> {
        let client = self.client.as_ref().ok_or(SupervisorError::NotReady)?;
        client.exchange(request).await
    }

    /// Kill the serving worker, delete its source and clear its sentinel.
    ///
    /// Every step is attempted and all failures are reported together. With
    /// no worker owned, whatever the sentinel store records is reconciled
    /// instead, so this is a no-op on a clean data root.
    pub async fn sigkill(&mut self) -> Result<(), SupervisorError> {
        self.require_mode(Mode::Serving)?;
        self.shutdown().await
    }

    /// Tear down the owned worker, or reconcile leftovers if there is none.
    ///
    /// Works in either mode and is idempotent.
    pub async fn cleanup(&mut self) -> Result<(), SupervisorError> {
        self.shutdown().await
    }

    /// Run a batch worker to completion.
    ///
    /// The source path is recorded before the worker is spawned, and the
    /// data root is reconciled again after it exits, whatever the outcome.
    pub async fn train(&mut self) -> Result<RunOutcome, SupervisorError> {
        self.require_mode(Mode::Batch)?;
        let source = template::render(&self.spec)?;

        self.lock_data_root()?;
        self.set_state(SupervisorState::Cleaning);
        if let Err(e) = self.reconcile().await {
            self.release(SupervisorState::Idle);
            return Err(e);
        }

        self.set_state(SupervisorState::Launching);
        let mut worker = match self.start(&source).await {
            Ok(worker) => worker,
            Err(e) => {
                self.release(SupervisorState::Idle);
                return Err(e);
            }
        };

        self.set_state(SupervisorState::Running);
        let exit = match self.spec.timing.run_timeout {
            None => Ok(worker.child.wait().await),
            Some(limit) => match tokio::time::timeout(limit, worker.child.wait()).await {
                Ok(exit) => Ok(exit),
                Err(_) => {
                    warn!(run_id = %worker.run_id, limit = ?limit, "Worker run timed out");
                    Err(SupervisorError::RunTimeout { limit })
                }
            },
        };

        let finished_at = Utc::now();
        let run_id = worker.run_id.clone();
        let started_at = worker.started_at;

        let failures = self.stop(worker).await;
        self.release(SupervisorState::Done);

        let exit = match exit {
            Ok(exit) => exit,
            Err(e) => return Err(e.with_failures(failures)),
        };

        if !exit.success() {
            warn!(run_id = %run_id, exit = %exit, "Worker run failed");
            return Err(SupervisorError::Run { exit }.with_failures(failures));
        }

        if !failures.is_empty() {
            return Err(SupervisorError::Cleanup {
                cause: None,
                failures,
            });
        }

        let outcome = RunOutcome {
            run_id,
            exit,
            result_path: self.spec.result_path().unwrap_or_default(),
            started_at,
            finished_at,
        };

        info!(
            run_id = %outcome.run_id,
            duration_ms = outcome.duration_ms(),
            result = %outcome.result_path.display(),
            "Worker run finished"
        );

        Ok(outcome)
    }

    fn require_mode(&self, expected: Mode) -> Result<(), SupervisorError> {
        let actual = self.spec.mode();
        if actual != expected {
            return Err(SupervisorError::ModeMismatch { expected, actual });
        }
        Ok(())
    }

    fn set_state(&mut self, next: SupervisorState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Supervisor state change");
            self.state = next;
        }
    }

    fn lock_data_root(&mut self) -> Result<(), SupervisorError> {
        if self.lock.is_none() {
            self.lock = Some(DataRootLock::acquire(&self.store)?);
        }
        Ok(())
    }

    fn release(&mut self, state: SupervisorState) {
        self.lock = None;
        self.set_state(state);
    }

    /// Remove whatever the sentinel store says may still exist.
    async fn reconcile(&self) -> Result<(), SupervisorError> {
        let record = self.store.read()?;
        if record.is_empty() {
            debug!(dir = %self.store.dir().display(), "No leftovers to reconcile");
        }

        if let Some(pid) = record.pid {
            if self.plan.reap_pid {
                info!(pid = pid, "Reaping orphaned worker");
                let timing = &self.spec.timing;
                reap_orphan(pid, timing.reap_interval, timing.reap_timeout).await?;
            } else {
                warn!(pid = pid, "Ignoring recorded pid");
            }
        }

        let mut failures = Vec::new();

        if let Some(source) = record.source.as_deref().filter(|_| self.plan.remove_source) {
            match remove_if_exists(source) {
                Ok(()) => debug!(path = %source.display(), "Removed leftover worker source"),
                Err(e) => {
                    warn!(path = %source.display(), error = %e, "Failed to remove leftover worker source");
                    failures.push(CleanupFailure::new(source.display().to_string(), e));
                }
            }
        }

        if let Err(more) = self.store.clear() {
            failures.extend(more);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::Cleanup {
                cause: None,
                failures,
            })
        }
    }

    /// Write, record and spawn a fresh worker.
    async fn start(&self, source: &[u8]) -> Result<ManagedWorker, SupervisorError> {
        let rendered = self.launcher.write_source(source)?;

        if let Err(e) = self
            .store
            .record(&SentinelRecord::for_source(rendered.path()))
        {
            return Err(e.with_failures(self.discard(&rendered, None)));
        }

        let child = match self.launcher.spawn(&rendered) {
            Ok(child) => child,
            Err(e) => return Err(e.with_failures(self.discard(&rendered, None))),
        };

        let worker = ManagedWorker {
            run_id: RunId::generate(),
            rendered,
            child,
            started_at: Utc::now(),
        };

        info!(
            run_id = %worker.run_id,
            workload = self.spec.workload.name(),
            pid = worker.child.pid(),
            "Worker started"
        );

        if self.plan.reap_pid {
            let record = SentinelRecord::new(worker.child.pid(), worker.rendered.path());
            if let Err(e) = self.store.record(&record) {
                let failures = self.stop(worker).await;
                return Err(e.with_failures(failures));
            }
        }

        Ok(worker)
    }

    async fn await_ready(&self, worker: &ManagedWorker) -> Result<ExchangeClient, SupervisorError> {
        let endpoint = self.spec.endpoint();
        let timing = &self.spec.timing;

        let prober = ReadinessProber::new(
            endpoint.clone(),
            timing.probe_interval,
            timing.readiness_timeout,
            timing.request_timeout,
        )?;

        match prober.await_ready(&worker.child.exited()).await? {
            ProbeOutcome::Ready { .. } => ExchangeClient::new(&endpoint, timing.request_timeout),
            ProbeOutcome::Cancelled { .. } => Err(SupervisorError::WorkerExited {
                outcome: worker.child.try_exit().unwrap_or_else(|| ExitOutcome::Unknown {
                    reason: "exit not observed".to_string(),
                }),
            }),
        }
    }

    /// Kill `worker`, remove its source and clear the sentinel, attempting every step.
    ///
    /// A worker that survives the kill keeps its pid recorded so a later
    /// `cleanup` can still reap it.
    async fn stop(&self, mut worker: ManagedWorker) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        let pid = worker.child.pid();

        let survivor = match worker.child.kill(self.spec.timing.kill_grace).await {
            Ok(exit) => {
                debug!(run_id = %worker.run_id, pid = pid, exit = %exit, "Worker stopped");
                None
            }
            Err(e) => {
                warn!(run_id = %worker.run_id, pid = pid, error = %e, "Failed to kill worker");
                failures.push(CleanupFailure::new(format!("pid {}", pid), e));
                Some(pid)
            }
        };

        failures.extend(self.discard(&worker.rendered, survivor));
        failures
    }

    /// Remove `rendered`, then clear the sentinel or narrow it to `survivor`.
    fn discard(&self, rendered: &RenderedWorker, survivor: Option<u32>) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();

        if let Err(e) = rendered.remove() {
            warn!(path = %rendered.path().display(), error = %e, "Failed to remove worker source");
            failures.push(CleanupFailure::new(rendered.path().display().to_string(), e));
        }

        match survivor {
            Some(pid) => {
                if let Err(e) = self.store.record(&SentinelRecord::for_pid(pid)) {
                    warn!(pid = pid, error = %e, "Failed to record surviving worker");
                    failures.push(CleanupFailure::new(self.store.record_path().display().to_string(), e));
                }
            }
            None => {
                if let Err(more) = self.store.clear() {
                    failures.extend(more);
                }
            }
        }

        failures
    }

    async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        // The client is kept so late exchanges fail at the network level.
        let result = match self.worker.take() {
            Some(worker) => {
                self.set_state(SupervisorState::Terminating);
                info!(run_id = %worker.run_id, pid = worker.child.pid(), "Terminating worker");
                let failures = self.stop(worker).await;
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(SupervisorError::Cleanup {
                        cause: None,
                        failures,
                    })
                }
            }
            None => match self.lock_data_root() {
                Ok(()) => {
                    self.set_state(SupervisorState::Cleaning);
                    self.reconcile().await
                }
                Err(e) => Err(e),
            },
        };

        self.release(SupervisorState::Idle);
        result
    }
}
