//! File-drop job queue between a submitter and a polling compute backend.
//!
//! The only coordination primitive is an atomic rename of a fully written
//! archive inside a shared directory: submitters publish work units through
//! [`submit::JobBundler`], the backend's results come back through
//! [`retrieve::ResultRetriever`]. The queue itself never retries or blocks,
//! any polling cadence belongs to the loop driving it.

pub mod config;
pub mod metadata;
pub mod retrieve;
pub mod stamp;
pub mod submit;

pub use config::{ConfigError, QueueConfig};
pub use metadata::JobMetadata;
pub use retrieve::{JobResult, ResultRetriever, RetrievalError};
pub use submit::{JobBundler, JobRequest, SubmitError};
