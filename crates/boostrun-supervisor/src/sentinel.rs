//! On-disk sentinel state that survives supervisor crashes.
//!
//! Each supervised data root carries at most one structured record,
//! `<stem>.sentinel.json`, naming the worker pid and the rendered source
//! file. It is written to a temp file in the same directory and renamed into
//! place, so a crash never leaves half a record behind.
//!
//! Supervisors from before the structured record wrote two plain files
//! instead: `<stem>.pid` (decimal pid and a newline) and `<stem>.pat` (the
//! source path). Those are still read and removed during reconciliation so
//! their leftovers are recovered, but never written.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use boostrun_core::JobSpec;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CleanupFailure, SupervisorError};

/// What a supervisor believes may still exist for its data root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelRecord {
    /// Pid of a worker that may still be running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Rendered worker source that may still exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl SentinelRecord {
    /// Record for a running worker.
    pub fn new(pid: u32, source: impl Into<PathBuf>) -> Self {
        Self {
            pid: Some(pid),
            source: Some(source.into()),
        }
    }

    /// Record for a source file whose process has not been started yet.
    pub fn for_source(source: impl Into<PathBuf>) -> Self {
        Self {
            pid: None,
            source: Some(source.into()),
        }
    }

    /// Record for a worker whose source is already gone.
    pub fn for_pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            source: None,
        }
    }

    /// Returns true if the record asserts nothing.
    pub fn is_empty(&self) -> bool {
        self.pid.is_none() && self.source.is_none()
    }
}

/// Reads and writes the sentinel record of one data root.
///
/// The store is not safe for concurrent use by two supervisors; hold a
/// [`DataRootLock`] while using it.
#[derive(Debug, Clone)]
pub struct SentinelStore {
    dir: PathBuf,
    stem: String,
}

impl SentinelStore {
    /// Store for sentinels named `<stem>.*` inside `dir`.
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
        }
    }

    /// Store used by supervisors of `spec`.
    pub fn for_job(spec: &JobSpec) -> Self {
        Self::new(spec.sentinel_dir(), spec.sentinel_stem())
    }

    /// Directory holding the sentinel files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the structured record.
    pub fn record_path(&self) -> PathBuf {
        self.dir.join(format!("{}.sentinel.json", self.stem))
    }

    /// Path of the legacy pid file.
    pub fn legacy_pid_path(&self) -> PathBuf {
        self.dir.join(format!("{}.pid", self.stem))
    }

    /// Path of the legacy source path file.
    pub fn legacy_source_path(&self) -> PathBuf {
        self.dir.join(format!("{}.pat", self.stem))
    }

    /// Persist `record`, replacing whatever was recorded before.
    pub fn record(&self, record: &SentinelRecord) -> Result<(), SupervisorError> {
        let path = self.record_path();
        fs::create_dir_all(&self.dir).map_err(SupervisorError::sentinel(&self.dir))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.sentinel", self.stem))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(SupervisorError::sentinel(&path))?;

        let json = serde_json::to_vec(record)
            .map_err(|e| SupervisorError::sentinel(&path)(io::Error::other(e)))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.write_all(b"\n"))
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(SupervisorError::sentinel(&path))?;

        tmp.persist(&path)
            .map_err(|e| SupervisorError::sentinel(&path)(e.error))?;

        debug!(path = %path.display(), pid = ?record.pid, source = ?record.source, "Sentinel recorded");
        Ok(())
    }

    /// Read whatever is recorded, merging in legacy files.
    pub fn read(&self) -> Result<SentinelRecord, SupervisorError> {
        let mut record = match read_optional(&self.record_path())? {
            Some(text) => serde_json::from_str::<SentinelRecord>(&text).map_err(|e| {
                SupervisorError::CorruptSentinel {
                    path: self.record_path(),
                    reason: e.to_string(),
                }
            })?,
            None => SentinelRecord::default(),
        };

        if record.pid.is_none() {
            let path = self.legacy_pid_path();
            if let Some(text) = read_optional(&path)? {
                record.pid = Some(parse_pid(&text).map_err(|reason| {
                    SupervisorError::CorruptSentinel { path, reason }
                })?);
            }
        }

        if record.source.is_none() {
            if let Some(text) = read_optional(&self.legacy_source_path())? {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    record.source = Some(PathBuf::from(trimmed));
                }
            }
        }

        if let Some(pid) = record.pid {
            check_pid(pid).map_err(|reason| SupervisorError::CorruptSentinel {
                path: self.record_path(),
                reason,
            })?;
        }

        Ok(record)
    }

    /// Remove every sentinel file that exists.
    ///
    /// Each removal is attempted even if an earlier one failed; all failures
    /// are returned together. Clearing an empty store is a no-op.
    pub fn clear(&self) -> Result<(), Vec<CleanupFailure>> {
        let mut failures = Vec::new();

        for path in [
            self.record_path(),
            self.legacy_pid_path(),
            self.legacy_source_path(),
        ] {
            if let Err(e) = remove_if_exists(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove sentinel");
                failures.push(CleanupFailure::new(path.display().to_string(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}

/// Exclusive advisory lock on a data root, held for as long as the value lives.
///
/// The lock is an `flock` on `<stem>.lock` next to the sentinel, so the
/// kernel drops it when the holding process dies. The lock file itself is
/// left in place.
pub struct DataRootLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl DataRootLock {
    /// Take the lock for `store`, failing fast if another supervisor holds it.
    pub fn acquire(store: &SentinelStore) -> Result<Self, SupervisorError> {
        let path = store.dir.join(format!("{}.lock", store.stem));
        fs::create_dir_all(&store.dir).map_err(SupervisorError::sentinel(&store.dir))?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(SupervisorError::sentinel(&path))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => {
                debug!(path = %path.display(), "Data root locked");
                Ok(Self { _file: file, path })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                Err(SupervisorError::DataRootBusy { path })
            }
            Err((_, errno)) => Err(SupervisorError::Sentinel {
                path,
                source: io::Error::from(errno),
            }),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for DataRootLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRootLock").field("path", &self.path).finish()
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, SupervisorError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SupervisorError::sentinel(path)(e)),
    }
}

fn parse_pid(text: &str) -> Result<u32, String> {
    let trimmed = text.trim();
    trimmed
        .parse::<u32>()
        .map_err(|e| format!("'{}' is not a pid: {}", trimmed, e))
}

// pid 0 and 1 address the process group and init; never signal those.
fn check_pid(pid: u32) -> Result<(), String> {
    if pid <= 1 || i32::try_from(pid).is_err() {
        return Err(format!("{} is not a worker pid", pid));
    }
    Ok(())
}
