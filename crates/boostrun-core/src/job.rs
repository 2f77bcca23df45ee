//! Job descriptions for supervised workers.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Host used when a serving job does not name one.
pub const DEFAULT_ADDRESS: &str = "localhost";

/// Interpreter used to execute rendered worker sources.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Lifecycle a worker follows once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Long-running worker answering prediction requests until killed.
    Serving,
    /// One-shot worker that runs to completion and exits.
    Batch,
}

/// Which worker a job describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Workload {
    /// Serve predictions from the trained ensemble over HTTP.
    Serving,
    /// Train the bucket models of a single buffer.
    TrainModel { buffer: String },
    /// Train the combining ensemble over all buffers.
    TrainEnsemble,
}

impl Workload {
    /// Lifecycle mode of this workload.
    pub fn mode(&self) -> Mode {
        match self {
            Self::Serving => Mode::Serving,
            Self::TrainModel { .. } | Self::TrainEnsemble => Mode::Batch,
        }
    }

    /// Short name used for sentinel file stems and temp file prefixes.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Serving => "loader",
            Self::TrainModel { .. } => "model",
            Self::TrainEnsemble => "ensemble",
        }
    }
}

/// Time bounds for every suspension point of a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    /// Pause between two readiness probes.
    pub probe_interval: Duration,

    /// Total time a serving worker gets to answer its health check.
    pub readiness_timeout: Duration,

    /// Timeout of a single HTTP request to the worker.
    pub request_timeout: Duration,

    /// Pause between two liveness checks of a reaped orphan.
    pub reap_interval: Duration,

    /// Total time an orphan gets to disappear after being killed.
    pub reap_timeout: Duration,

    /// Time an owned worker gets to be reaped after SIGKILL.
    pub kill_grace: Duration,

    /// Upper bound on a batch run; `None` waits for the worker indefinitely.
    pub run_timeout: Option<Duration>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(3),
            readiness_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_millis(250),
            reap_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            run_timeout: None,
        }
    }
}

/// Immutable description of one supervised worker.
///
/// Build it with one of the workload constructors and the `with_*` methods,
/// then hand it to a supervisor, which calls [`JobSpec::validate`] before
/// touching the filesystem.
///
/// Two supervisors must not target the same data root at the same time. The
/// supervisor enforces this with an advisory lock next to its sentinel, but
/// callers spreading work across hosts on shared storage must provide their
/// own mutual exclusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Which worker to run.
    pub workload: Workload,

    /// Directory holding all buffer and ensemble data.
    pub data_root: PathBuf,

    /// Host the serving worker binds to.
    pub address: String,

    /// Port the serving worker binds to.
    pub port: u16,

    /// Bucket identifiers, in training order.
    pub buckets: Vec<String>,

    /// Buffer identifiers for serving and ensemble training.
    pub buffers: Vec<String>,

    /// Worker source template; `None` uses the workload's default.
    pub template: Option<String>,

    /// Forward the worker's stdout/stderr to the supervisor log.
    pub debug: bool,

    /// Continue training from existing bucket models.
    pub continue_training: bool,

    /// Maximum error a trained model may have to be kept.
    pub threshold: Option<f64>,

    /// Program executing the rendered source.
    pub interpreter: String,

    /// Time bounds.
    pub timing: Timing,
}

impl JobSpec {
    fn with_workload(workload: Workload, data_root: impl Into<PathBuf>) -> Self {
        Self {
            workload,
            data_root: data_root.into(),
            address: DEFAULT_ADDRESS.to_string(),
            port: 0,
            buckets: Vec::new(),
            buffers: Vec::new(),
            template: None,
            debug: false,
            continue_training: false,
            threshold: None,
            interpreter: DEFAULT_INTERPRETER.to_string(),
            timing: Timing::default(),
        }
    }

    /// A serving job answering predictions on `port`.
    pub fn serving(data_root: impl Into<PathBuf>, port: u16) -> Self {
        let mut spec = Self::with_workload(Workload::Serving, data_root);
        spec.port = port;
        spec
    }

    /// A batch job training the bucket models of `buffer`.
    pub fn train_model(data_root: impl Into<PathBuf>, buffer: impl Into<String>) -> Self {
        Self::with_workload(
            Workload::TrainModel {
                buffer: buffer.into(),
            },
            data_root,
        )
    }

    /// A batch job training the combining ensemble.
    pub fn train_ensemble(data_root: impl Into<PathBuf>) -> Self {
        Self::with_workload(Workload::TrainEnsemble, data_root)
    }

    /// Builder method to set the bind address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Builder method to add a bucket.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.buckets.push(bucket.into());
        self
    }

    /// Builder method to set all buckets.
    pub fn with_buckets<I, S>(mut self, buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.buckets = buckets.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to add a buffer.
    pub fn with_buffer(mut self, buffer: impl Into<String>) -> Self {
        self.buffers.push(buffer.into());
        self
    }

    /// Builder method to set all buffers.
    pub fn with_buffers<I, S>(mut self, buffers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.buffers = buffers.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to override the worker template.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Builder method to forward worker output.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Builder method to continue training existing models.
    pub fn with_continue_training(mut self, continue_training: bool) -> Self {
        self.continue_training = continue_training;
        self
    }

    /// Builder method to set the acceptance threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Builder method to set the interpreter.
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Builder method to set time bounds.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Lifecycle mode of this job.
    pub fn mode(&self) -> Mode {
        self.workload.mode()
    }

    /// Base URL of the serving worker.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    /// Data root as handed to templates, without a trailing slash.
    pub fn data_root_param(&self) -> String {
        let root = self.data_root.to_string_lossy();
        let trimmed = root.trim_end_matches('/');
        if trimmed.is_empty() && root.starts_with('/') {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Directory holding this job's sentinel and lock files.
    pub fn sentinel_dir(&self) -> PathBuf {
        match &self.workload {
            Workload::TrainModel { buffer } => self.data_root.join(buffer),
            Workload::Serving | Workload::TrainEnsemble => self.data_root.clone(),
        }
    }

    /// File stem of this job's sentinel and lock files.
    pub fn sentinel_stem(&self) -> &'static str {
        self.workload.name()
    }

    /// Where a batch worker writes its result document.
    pub fn result_path(&self) -> Option<PathBuf> {
        match &self.workload {
            Workload::Serving => None,
            Workload::TrainModel { buffer } => {
                Some(self.data_root.join(buffer).join("res").join("res.json"))
            }
            Workload::TrainEnsemble => Some(self.data_root.join("res").join("res.json")),
        }
    }

    /// The template text to render, if the caller supplied a non-blank one.
    pub fn custom_template(&self) -> Option<&str> {
        self.template.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Check that every required field is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_root.as_os_str().is_empty() {
            return Err(ConfigError::missing("data_root"));
        }

        if self.interpreter.trim().is_empty() {
            return Err(ConfigError::missing("interpreter"));
        }

        validate_names("buckets", &self.buckets)?;

        match &self.workload {
            Workload::Serving => {
                if self.address.trim().is_empty() {
                    return Err(ConfigError::missing("address"));
                }
                if self.port == 0 {
                    return Err(ConfigError::missing("port"));
                }
                validate_names("buffers", &self.buffers)?;
            }
            Workload::TrainModel { buffer } => {
                if buffer.trim().is_empty() {
                    return Err(ConfigError::missing("buffer"));
                }
                validate_component("buffer", buffer)?;
                match self.threshold {
                    None => return Err(ConfigError::missing("threshold")),
                    Some(t) if !t.is_finite() || t <= 0.0 => {
                        return Err(ConfigError::invalid(
                            "threshold",
                            format!("{} is not a positive number", t),
                        ))
                    }
                    Some(_) => {}
                }
            }
            Workload::TrainEnsemble => {
                validate_names("buffers", &self.buffers)?;
            }
        }

        self.validate_timing()
    }

    fn validate_timing(&self) -> Result<(), ConfigError> {
        let t = &self.timing;
        let zero = Duration::ZERO;

        if t.probe_interval == zero {
            return Err(ConfigError::invalid("timing.probe_interval", "must be positive"));
        }
        if t.readiness_timeout == zero {
            return Err(ConfigError::invalid("timing.readiness_timeout", "must be positive"));
        }
        if t.request_timeout == zero {
            return Err(ConfigError::invalid("timing.request_timeout", "must be positive"));
        }
        if t.reap_interval == zero {
            return Err(ConfigError::invalid("timing.reap_interval", "must be positive"));
        }
        if t.run_timeout == Some(zero) {
            return Err(ConfigError::invalid("timing.run_timeout", "must be positive"));
        }
        Ok(())
    }
}

fn validate_names(field: &'static str, names: &[String]) -> Result<(), ConfigError> {
    if names.is_empty() {
        return Err(ConfigError::missing(field));
    }
    for name in names {
        if name.trim().is_empty() {
            return Err(ConfigError::invalid(field, "contains an empty identifier"));
        }
        validate_component(field, name)?;
    }
    Ok(())
}

// Identifiers become path components inside the data root.
fn validate_component(field: &'static str, name: &str) -> Result<(), ConfigError> {
    let path = Path::new(name);
    if name.contains('/') || name == "." || name == ".." || path.is_absolute() {
        return Err(ConfigError::invalid(
            field,
            format!("'{}' is not a plain identifier", name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serving() -> JobSpec {
        JobSpec::serving("/data/", 9999)
            .with_buffers(["foo", "bar"])
            .with_bucket("m1")
    }

    #[test]
    fn test_serving_spec_is_valid() {
        let spec = serving();
        assert_eq!(spec.validate(), Ok(()));
        assert_eq!(spec.mode(), Mode::Serving);
        assert_eq!(spec.endpoint(), "http://localhost:9999");
        assert_eq!(spec.data_root_param(), "/data");
        assert_eq!(spec.sentinel_dir(), PathBuf::from("/data/"));
        assert_eq!(spec.sentinel_stem(), "loader");
        assert!(spec.result_path().is_none());
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            serving().with_buckets(Vec::<String>::new()).validate(),
            Err(ConfigError::missing("buckets"))
        );
        assert_eq!(
            serving().with_buffers(Vec::<String>::new()).validate(),
            Err(ConfigError::missing("buffers"))
        );
        assert_eq!(
            JobSpec::serving("/data", 0)
                .with_buffer("b")
                .with_bucket("x")
                .validate(),
            Err(ConfigError::missing("port"))
        );
        assert_eq!(
            JobSpec::serving("", 1).with_buffer("b").with_bucket("x").validate(),
            Err(ConfigError::missing("data_root"))
        );
        assert_eq!(
            serving().with_address(" ").validate(),
            Err(ConfigError::missing("address"))
        );
    }

    #[test]
    fn test_train_model_requires_threshold() {
        let spec = JobSpec::train_model("/data", "b1").with_bucket("x");
        assert_eq!(spec.validate(), Err(ConfigError::missing("threshold")));

        let spec = spec.with_threshold(0.05);
        assert_eq!(spec.validate(), Ok(()));
        assert_eq!(spec.mode(), Mode::Batch);
        assert_eq!(spec.sentinel_dir(), PathBuf::from("/data/b1"));
        assert_eq!(
            spec.result_path(),
            Some(PathBuf::from("/data/b1/res/res.json"))
        );

        assert!(matches!(
            spec.with_threshold(f64::NAN).validate(),
            Err(ConfigError::InvalidField { field: "threshold", .. })
        ));
    }

    #[test]
    fn test_train_model_rejects_path_like_buffer() {
        let spec = JobSpec::train_model("/data", "../etc")
            .with_bucket("x")
            .with_threshold(0.1);
        assert!(matches!(
            spec.validate(),
            Err(ConfigError::InvalidField { field: "buffer", .. })
        ));
    }

    #[test]
    fn test_train_ensemble_paths() {
        let spec = JobSpec::train_ensemble("/data")
            .with_buffers(["b1", "b2"])
            .with_bucket("x");
        assert_eq!(spec.validate(), Ok(()));
        assert_eq!(spec.sentinel_stem(), "ensemble");
        assert_eq!(spec.result_path(), Some(PathBuf::from("/data/res/res.json")));
    }

    #[test]
    fn test_zero_probe_interval_is_rejected() {
        let timing = Timing {
            probe_interval: Duration::ZERO,
            ..Timing::default()
        };
        assert!(matches!(
            serving().with_timing(timing).validate(),
            Err(ConfigError::InvalidField { field: "timing.probe_interval", .. })
        ));
    }

    #[test]
    fn test_blank_template_falls_back_to_default() {
        assert!(serving().with_template("  \n").custom_template().is_none());
        assert_eq!(
            serving().with_template("print(1)").custom_template(),
            Some("print(1)")
        );
    }
}
