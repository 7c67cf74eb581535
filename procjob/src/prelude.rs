//! The purpose of this module is to alleviate the need to import many of the `[procjob]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use procjob::prelude::*;
//! ```
pub use crate::config::RunnerConfig;
pub use crate::job::command::{CommandSpec, TranscriptionRequest};
pub use crate::job::{
    ExecutionError, Job, JobFailure, JobId, JobOutput, JobProgress, JobSpec, JobStatus,
};
pub use crate::pruner::{Pruner, PrunerConfig};
pub use crate::registry::JobRegistry;
pub use crate::runner::{JobHandle, JobRunner, RunOutcome};
pub use crate::{JobManager, ProcJobError};
