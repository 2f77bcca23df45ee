//! Supervision of external boostrun workers.
//!
//! This crate turns a [`JobSpec`](boostrun_core::JobSpec) into a running
//! worker program: it renders the worker source from a template, launches it
//! under an interpreter, waits until it answers its health check, exchanges
//! prediction requests with it over HTTP, and makes sure neither a crashed
//! worker nor a crashed supervisor leaves processes or files behind.
//!
//! # Example
//!
//! ```rust,no_run
//! use boostrun_core::{ExchangeRequest, JobSpec};
//! use boostrun_supervisor::Supervisor;
//!
//! async fn serve() -> Result<(), Box<dyn std::error::Error>> {
//!     let spec = JobSpec::serving("/data/boost", 9999)
//!         .with_buffers(["foo", "bar"])
//!         .with_bucket("m1");
//!
//!     let mut supervisor = Supervisor::new(spec)?;
//!     supervisor.restore().await?;
//!
//!     let request = ExchangeRequest::new()
//!         .with_channel("foo", vec![1.0, 2.0])
//!         .with_channel("bar", vec![0.3]);
//!     println!("prediction: {}", supervisor.exchange(&request).await?);
//!
//!     supervisor.sigkill().await?;
//!     Ok(())
//! }
//! ```

mod buffers;
mod error;
mod exchange;
mod launcher;
mod probe;
mod reap;
mod sentinel;
mod supervisor;
mod template;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use buffers::discover_buffers;
pub use error::{CleanupFailure, SupervisorError};
pub use exchange::{parse_prediction, ExchangeClient};
pub use launcher::{ChildProcess, Launcher, RenderedWorker, WORKER_OUTPUT_TARGET};
pub use probe::{ProbeOutcome, ReadinessProber};
pub use reap::reap_orphan;
pub use sentinel::{DataRootLock, SentinelRecord, SentinelStore};
pub use supervisor::{ReconcilePlan, Supervisor};
pub use template::{
    default_template, render, render_template, TemplateParams, ENSEMBLE_TEMPLATE, MODEL_TEMPLATE,
    SERVING_TEMPLATE,
};
