//! An in process job manager for long running external commands.
//!
//! Jobs are registered in a [`registry::JobRegistry`] and executed by a [`runner::JobRunner`],
//! each in its own tokio task owning the child process. Callers poll for progress using the job's
//! id. When a job finishes, its record holds the contents of the file the command was expected to
//! produce or the reason it failed.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use procjob::prelude::*;
//!
//! # async fn run() -> Result<(), ProcJobError> {
//! let manager = JobManager::new(RunnerConfig::new().with_timeout(Duration::from_secs(3600)))?;
//!
//! let spec = TranscriptionRequest::default()
//!     .with_model("small")
//!     .into_job_spec("uploads/interview.mp3", "transcripts")?;
//! let id = manager.submit(spec)?;
//!
//! let job = manager.status(&id)?;
//! println!("{}", job.status());
//!
//! manager.graceful_shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Setting up a job pruner
//!
//! Finished jobs stay in the registry until they are cancelled. To remove them periodically
//! configure a pruner, see [`pruner`].
//!
//! ```
//! # use std::str::FromStr;
//! use chrono::TimeDelta;
//! use procjob::prelude::*;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let config = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
//!     .with_pruner(Pruner::max_age(TimeDelta::days(1), JobStatus::Complete))
//!     .with_pruner(Pruner::max_length(100, JobStatus::Error));
//!
//! let manager = JobManager::default().with_job_pruner(config);
//! # manager.graceful_shutdown().await;
//! # });
//! ```
pub mod config;
pub mod job;
pub mod prelude;
pub mod pruner;
pub mod registry;
pub mod runner;
pub mod testing;

use config::RunnerConfig;
use job::{Job, JobId, JobSpec};
use pruner::{runner::PrunerRunner, PrunerConfig};
use registry::{JobRegistry, RegistryError};
use runner::{JobHandle, JobRunner};
use thiserror::Error;
use tokio_util::sync::DropGuard;

/// Owns a registry and the runner executing its jobs, and optionally a pruner.
///
/// The pruner stops when the manager is dropped or shut down. Running jobs are only stopped by
/// [`JobManager::graceful_shutdown`].
#[derive(Debug)]
pub struct JobManager {
    runner: JobRunner,
    pruner: Option<DropGuard>,
}

impl Default for JobManager {
    fn default() -> Self {
        Self {
            runner: JobRunner::new(JobRegistry::new(), RunnerConfig::default()),
            pruner: None,
        }
    }
}

impl JobManager {
    pub fn new(config: RunnerConfig) -> Result<Self, ProcJobError> {
        config.validate()?;
        Ok(Self {
            runner: JobRunner::new(JobRegistry::new(), config),
            pruner: None,
        })
    }

    /// Periodically remove finished jobs according to `config`.
    ///
    /// Replaces any previously configured pruner. Must be called from within a tokio runtime.
    pub fn with_job_pruner(mut self, config: PrunerConfig) -> Self {
        let token = self.runner.shutdown_token();
        PrunerRunner::new(self.runner.registry().clone(), config)
            .spawn(self.runner.tracker(), token.clone());
        self.pruner = Some(token.drop_guard());
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        self.runner.registry()
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    /// Register a job and start running it right away.
    ///
    /// If the job cannot be dispatched its record is removed again.
    pub fn submit(&self, spec: JobSpec) -> Result<JobId, ProcJobError> {
        self.submit_with_handle(spec).map(|handle| handle.id())
    }

    /// Like [`JobManager::submit`] but returns the handle of the task running the job.
    pub fn submit_with_handle(&self, spec: JobSpec) -> Result<JobHandle, ProcJobError> {
        let id = self.registry().create(spec)?;
        self.runner.dispatch(id).map_err(|err| {
            if let Err(cleanup) = self.registry().remove(&id) {
                tracing::error!(%id, ?cleanup, "Failed to remove undispatched job {id}: {cleanup}");
            }
            err
        })
    }

    pub fn status(&self, id: &JobId) -> Result<Job, ProcJobError> {
        self.runner.status(id)
    }

    pub fn cancel(&self, id: &JobId) -> Result<(), ProcJobError> {
        self.runner.cancel(id)
    }

    /// Stop the pruner, kill all running jobs and wait for their tasks to finish.
    pub async fn graceful_shutdown(self) {
        tracing::debug!("Shutting down job manager");
        drop(self.pruner);
        self.runner.graceful_shutdown().await;
    }
}

#[derive(Debug, Error)]
pub enum ProcJobError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {0} has already been dispatched")]
    AlreadyDispatched(JobId),
    #[error("Job registry in bad state")]
    BadState,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Job runner is shutting down")]
    ShuttingDown,
    #[error("Job task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

impl From<RegistryError> for ProcJobError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::BadState => Self::BadState,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        job::{ExecutionError, JobStatus},
        testing::{sh, wait_for_terminal},
    };

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn submitted_job_completes() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.txt");
        let manager = JobManager::default();

        let id = manager
            .submit(JobSpec::new(
                sh(&format!("printf 'hello world' > {}", output.display())),
                &output,
            ))
            .unwrap();
        let job = wait_for_terminal(&manager, &id, WAIT).await.unwrap();

        assert_eq!(job.status(), JobStatus::Complete);
        let output = job.output().unwrap();
        assert_eq!(output.content, "hello world");
        assert_eq!(output.filename, "clip.txt");
    }

    #[tokio::test]
    async fn failed_job_reports_reason_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::default();

        let id = manager
            .submit(JobSpec::new(
                sh("echo 'model not found' >&2; exit 1"),
                dir.path().join("clip.txt"),
            ))
            .unwrap();
        let job = wait_for_terminal(&manager, &id, WAIT).await.unwrap();

        let failure = job.failure().unwrap();
        assert_matches!(failure.error, ExecutionError::CommandFailed { .. });
        assert_eq!(failure.logs, "model not found\n");
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "command failed");
    }

    #[tokio::test]
    async fn cancel_removes_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::default();
        let handle = manager
            .submit_with_handle(JobSpec::new(sh("sleep 5"), dir.path().join("out.txt")))
            .unwrap();
        let id = handle.id();

        manager.cancel(&id).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, runner::RunOutcome::Cancelled);
        assert_matches!(manager.status(&id), Err(ProcJobError::JobNotFound(_)));
        assert_matches!(manager.cancel(&id), Err(ProcJobError::JobNotFound(_)));
        assert!(manager.registry().is_empty().unwrap());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let manager = JobManager::default();
        let id = JobId::new();

        assert_matches!(manager.status(&id), Err(ProcJobError::JobNotFound(other)) if other == id);
        assert_matches!(manager.cancel(&id), Err(ProcJobError::JobNotFound(_)));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let result = JobManager::new(RunnerConfig::new().with_timeout(Duration::ZERO));
        assert_matches!(result, Err(ProcJobError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn submit_after_shutdown_leaves_no_record() {
        let manager = JobManager::default();
        manager.runner().graceful_shutdown().await;

        let result = manager.submit(JobSpec::new(sh("true"), "out.txt"));

        assert_matches!(result, Err(ProcJobError::ShuttingDown));
        assert!(manager.registry().is_empty().unwrap());
    }

    #[tokio::test]
    async fn shutdown_fails_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::default();
        let id = manager
            .submit(JobSpec::new(sh("sleep 5"), dir.path().join("out.txt")))
            .unwrap();
        let registry = manager.registry().clone();

        tokio::time::timeout(Duration::from_secs(2), manager.graceful_shutdown())
            .await
            .unwrap();

        let job = registry.get(&id).unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Error);
        assert_eq!(job.failure().unwrap().reason(), "runner shut down");
    }

    #[tokio::test]
    async fn pruner_removes_finished_jobs() {
        use std::str::FromStr;

        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::default().with_job_pruner(
            PrunerConfig::new(cron::Schedule::from_str("* * * * * *").unwrap())
                .with_pruner(pruner::Pruner::max_length(0, JobStatus::Error)),
        );
        let id = manager
            .submit(JobSpec::new(sh("exit 1"), dir.path().join("out.txt")))
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while manager.registry().get(&id).unwrap().is_some() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        manager.graceful_shutdown().await;
    }

    fn every_second() -> PrunerConfig {
        use std::str::FromStr;

        PrunerConfig::new(cron::Schedule::from_str("* * * * * *").unwrap())
            .with_pruner(pruner::Pruner::max_length(10, JobStatus::Complete))
    }

    async fn wait_until_idle(runner: &JobRunner) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !runner.tracker().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("background tasks still running");
    }

    #[tokio::test]
    async fn dropping_manager_stops_pruner() {
        let manager = JobManager::default().with_job_pruner(every_second());
        let runner = manager.runner().clone();
        assert_eq!(runner.tracker().len(), 1);

        drop(manager);

        wait_until_idle(&runner).await;
    }

    #[tokio::test]
    async fn replacing_pruner_stops_the_previous_one() {
        let manager = JobManager::default()
            .with_job_pruner(every_second())
            .with_job_pruner(every_second());
        let runner = manager.runner().clone();

        tokio::time::timeout(Duration::from_secs(3), async {
            while runner.tracker().len() > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("previous pruner still running");

        manager.graceful_shutdown().await;
        assert!(runner.tracker().is_empty());
    }

    #[tokio::test]
    async fn runner_shutdown_also_stops_pruner() {
        let manager = JobManager::default().with_job_pruner(every_second());

        tokio::time::timeout(Duration::from_secs(3), manager.runner().graceful_shutdown())
            .await
            .expect("shutdown waited on a pruner that never stopped");

        assert!(manager.runner().tracker().is_empty());
    }
}
