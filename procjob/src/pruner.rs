//! The API for configuring the job pruner.
//!
//! Finished jobs stay in the registry until they are cancelled, so a long running service slowly
//! accumulates records nobody will poll again. [`PrunerConfig`] enables cleaning those up on a
//! schedule.
//!
//! When constructing [`PrunerConfig`] a [`cron::Schedule`] is provided to specify when the pruner
//! should run. It can have any number of [`Pruner`]s, each targeting one terminal status, so it is
//! possible, for example, to:
//!
//! - keep only the last 100 completed jobs, and
//! - drop failed jobs a day after they failed.
//!
//! Queued and processing jobs are never pruned.
//!
//! # Example
//!
//! ```
//! # use procjob::prelude::*;
//! # use std::str::FromStr;
//! # use chrono::TimeDelta;
//! let config = PrunerConfig::new(cron::Schedule::from_str("0 */5 * * * *").unwrap())
//!     .with_pruner(Pruner::max_length(100, JobStatus::Complete))
//!     .with_pruner(Pruner::max_age(TimeDelta::days(1), JobStatus::Error));
//! ```
use chrono::TimeDelta;

pub(crate) mod runner;

use crate::job::JobStatus;

/// Configuration of when and how finished jobs are removed from the registry.
///
/// Once constructed, it should be passed to [`crate::JobManager::with_job_pruner`].
#[derive(Debug, Clone)]
pub struct PrunerConfig {
    schedule: cron::Schedule,
    pruners: Vec<PruneSpec>,
}

impl PrunerConfig {
    /// Construct a new instance of [`PrunerConfig`] scheduled to run on the provided cron
    /// schedule.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            pruners: Default::default(),
        }
    }

    /// Add a single [`Pruner`] to the config.
    pub fn with_pruner(mut self, pruner: Pruner) -> Self {
        self.pruners.push(pruner.into());
        self
    }

    /// Add multiple [`Pruner`]s to the config.
    pub fn with_pruners(mut self, pruners: impl IntoIterator<Item = Pruner>) -> Self {
        self.pruners.extend(pruners.into_iter().map(Into::into));
        self
    }
}

/// A single pruner as applied to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneSpec {
    /// The status of the jobs that should be affected by this pruner.
    pub status: JobStatus,
    /// The particular pruning strategy to apply, either max length or max age.
    pub prune_by: PruneBy,
}

/// How to prune the jobs of a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneBy {
    /// Remove jobs that finished longer ago than the given age.
    MaxAge(TimeDelta),
    /// Keep at most this many jobs, removing those that finished earliest.
    MaxLength(usize),
}

/// A single pruner targeting jobs of one status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pruner {
    status: JobStatus,
    prune_by: PruneBy,
}

impl Pruner {
    /// Remove jobs with `status` which finished more than `max_age` ago.
    pub const fn max_age(max_age: TimeDelta, status: JobStatus) -> Self {
        Self {
            status,
            prune_by: PruneBy::MaxAge(max_age),
        }
    }

    /// Keep only the `max_length` most recently finished jobs with `status`.
    pub const fn max_length(max_length: usize, status: JobStatus) -> Self {
        Self {
            status,
            prune_by: PruneBy::MaxLength(max_length),
        }
    }
}

impl From<Pruner> for PruneSpec {
    fn from(value: Pruner) -> Self {
        Self {
            status: value.status,
            prune_by: value.prune_by,
        }
    }
}
