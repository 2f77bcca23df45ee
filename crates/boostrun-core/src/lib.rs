//! boostrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Child processes
//! - Network/HTTP
//! - Runtime specifics
//!
//! All types here describe what a supervised worker job is, independent of
//! how the supervisor launches and talks to it.

pub mod error;
pub mod exchange;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod status;

// Re-export commonly used types
pub use error::ConfigError;
pub use exchange::ExchangeRequest;
pub use ids::RunId;
pub use job::{JobSpec, Mode, Timing, Workload, DEFAULT_ADDRESS, DEFAULT_INTERPRETER};
pub use outcome::{ExitOutcome, RunOutcome};
pub use status::SupervisorState;
