//! The in memory store of job records.
//!
//! [`JobRegistry`] is the single source of truth for which jobs exist and what state they are in.
//! Records are spread over a fixed number of shards, each guarded by its own lock, so that
//! transitions of unrelated jobs rarely contend with each other. Every mutation of a record
//! happens while holding its shard's write lock, which means readers only ever observe a record
//! before or after a transition, never half way through one.
use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    job::{Job, JobFailure, JobId, JobOutput, JobProgress, JobSpec, JobStatus},
    pruner::{PruneBy, PruneSpec},
};

const SHARD_COUNT: usize = 16;

type Shard = RwLock<FxHashMap<JobId, JobRecord>>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Job registry in bad state")]
    BadState,
}

/// A concurrency safe, cheaply cloneable store of job records.
#[derive(Clone)]
pub struct JobRegistry {
    shards: Arc<[Shard]>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::default()).collect(),
        }
    }

    fn shard(&self, id: &JobId) -> &Shard {
        &self.shards[fxhash::hash64(id) as usize % self.shards.len()]
    }

    /// Insert a new record in [`JobStatus::Queued`] and return its identifier.
    pub fn create(&self, spec: JobSpec) -> Result<JobId, RegistryError> {
        let record = JobRecord::new(spec);
        let id = record.id;
        self.shard(&id)
            .write()
            .map_err(|_| RegistryError::BadState)?
            .insert(id, record);
        tracing::debug!(%id, "Created job {id}");
        Ok(id)
    }

    /// A snapshot of the record, or [`None`] if it does not exist.
    pub fn get(&self, id: &JobId) -> Result<Option<Job>, RegistryError> {
        Ok(self
            .shard(id)
            .read()
            .map_err(|_| RegistryError::BadState)?
            .get(id)
            .map(JobRecord::snapshot))
    }

    /// Apply `mutation` to the record while holding its lock.
    ///
    /// Returns [`None`] without calling `mutation` when the record no longer exists, which is
    /// how a cancellation wins over a concurrent transition.
    pub fn update<T>(
        &self,
        id: &JobId,
        mutation: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<Option<T>, RegistryError> {
        Ok(self
            .shard(id)
            .write()
            .map_err(|_| RegistryError::BadState)?
            .get_mut(id)
            .map(mutation))
    }

    /// Delete the record, returning whether there was one to delete.
    pub fn remove(&self, id: &JobId) -> Result<bool, RegistryError> {
        self.take(id).map(|record| record.is_some())
    }

    pub(crate) fn take(&self, id: &JobId) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self
            .shard(id)
            .write()
            .map_err(|_| RegistryError::BadState)?
            .remove(id))
    }

    pub fn len(&self) -> Result<usize, RegistryError> {
        self.shards.iter().try_fold(0, |count, shard| {
            Ok(count + shard.read().map_err(|_| RegistryError::BadState)?.len())
        })
    }

    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        self.len().map(|len| len == 0)
    }

    /// The identifiers of all records currently held.
    pub fn ids(&self) -> Result<Vec<JobId>, RegistryError> {
        let mut ids = Vec::new();
        for shard in self.shards.iter() {
            ids.extend(shard.read().map_err(|_| RegistryError::BadState)?.keys().copied());
        }
        Ok(ids)
    }

    /// Remove the terminal records selected by `spec`, returning how many were removed.
    pub(crate) fn prune(&self, spec: &PruneSpec) -> Result<usize, RegistryError> {
        match spec.prune_by {
            PruneBy::MaxAge(max_age) => {
                let cutoff = Utc::now() - max_age;
                let mut removed = 0;
                for shard in self.shards.iter() {
                    let mut records = shard.write().map_err(|_| RegistryError::BadState)?;
                    let before = records.len();
                    records.retain(|_, record| {
                        !(record.status() == spec.status
                            && record.finished_at.is_some_and(|finished| finished < cutoff))
                    });
                    removed += before - records.len();
                }
                Ok(removed)
            }
            PruneBy::MaxLength(length) => {
                let mut finished = Vec::new();
                for shard in self.shards.iter() {
                    let records = shard.read().map_err(|_| RegistryError::BadState)?;
                    finished.extend(records.values().filter_map(|record| {
                        (record.status() == spec.status)
                            .then_some(record.finished_at)
                            .flatten()
                            .map(|finished_at| (finished_at, record.id))
                    }));
                }
                finished.sort_unstable_by(|a, b| b.0.cmp(&a.0));
                let mut removed = 0;
                for (_, id) in finished.into_iter().skip(length) {
                    if self.remove(&id)? {
                        removed += 1;
                    }
                }
                Ok(removed)
            }
        }
    }
}

pub(crate) enum JobState {
    Queued,
    Processing {
        started: Instant,
        cancellation: CancellationToken,
    },
    Complete {
        output: JobOutput,
        elapsed: Duration,
    },
    Error {
        failure: JobFailure,
    },
}

/// A job as held by the registry.
///
/// Only the runner that claimed a record moves it between states; everybody else gets a
/// [`Job`] snapshot.
pub struct JobRecord {
    id: JobId,
    spec: JobSpec,
    inserted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    state: JobState,
}

impl JobRecord {
    fn new(spec: JobSpec) -> Self {
        Self {
            id: JobId::new(),
            spec,
            inserted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            state: JobState::Queued,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Queued => JobStatus::Queued,
            JobState::Processing { .. } => JobStatus::Processing,
            JobState::Complete { .. } => JobStatus::Complete,
            JobState::Error { .. } => JobStatus::Error,
        }
    }

    pub(crate) fn cancellation(&self) -> Option<&CancellationToken> {
        match &self.state {
            JobState::Processing { cancellation, .. } => Some(cancellation),
            _ => None,
        }
    }

    /// Claim a queued record for execution, returning when it started.
    pub(crate) fn mark_processing(&mut self, cancellation: CancellationToken) -> Option<Instant> {
        if !matches!(self.state, JobState::Queued) {
            return None;
        }
        let started = Instant::now();
        self.started_at = Some(Utc::now());
        self.state = JobState::Processing {
            started,
            cancellation,
        };
        Some(started)
    }

    /// Move a processing record into its terminal state.
    ///
    /// Status and result are written together, so no reader sees one without the other.
    pub(crate) fn finish(
        &mut self,
        result: Result<(JobOutput, Duration), JobFailure>,
    ) -> Option<JobStatus> {
        if !matches!(self.state, JobState::Processing { .. }) {
            return None;
        }
        self.finished_at = Some(Utc::now());
        self.state = match result {
            Ok((output, elapsed)) => JobState::Complete { output, elapsed },
            Err(failure) => JobState::Error { failure },
        };
        Some(self.status())
    }

    fn snapshot(&self) -> Job {
        let progress = match &self.state {
            JobState::Queued => JobProgress::Queued,
            JobState::Processing { started, .. } => JobProgress::Processing {
                elapsed: started.elapsed(),
            },
            JobState::Complete { output, elapsed } => JobProgress::Complete {
                output: output.clone(),
                elapsed: *elapsed,
            },
            JobState::Error { failure } => JobProgress::Error {
                failure: failure.clone(),
            },
        };
        Job {
            id: self.id,
            spec: self.spec.clone(),
            inserted_at: self.inserted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            progress,
        }
    }
}
