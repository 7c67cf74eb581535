//! Executes jobs as external processes and keeps the registry in line with them.
//!
//! Every dispatched job gets its own task which owns the child process exclusively. The registry
//! only holds a [`CancellationToken`] for a processing job: cancelling a job removes its record
//! and fires the token, the owning task then kills the process and drops whatever result it had.
use std::{
    io,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};

use crate::{
    config::RunnerConfig,
    job::{ExecutionError, Job, JobFailure, JobId, JobOutput, JobSpec, JobStatus},
    registry::JobRegistry,
    ProcJobError,
};

/// How the task running a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The job reached the given terminal status.
    Finished(JobStatus),
    /// The job was cancelled; its record is gone and nothing was recorded.
    Cancelled,
    /// The result could not be recorded because the registry is in a bad state.
    Abandoned,
}

/// A handle to the task running a dispatched job.
///
/// Dropping it detaches the task, which keeps running to completion.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    handle: JoinHandle<RunOutcome>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the task to end.
    pub async fn wait(self) -> Result<RunOutcome, ProcJobError> {
        Ok(self.handle.await?)
    }
}

#[derive(Clone, Debug)]
pub struct JobRunner {
    registry: JobRegistry,
    config: RunnerConfig,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(registry: JobRegistry, config: RunnerConfig) -> Self {
        Self {
            registry,
            config,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// The tracker shutdown waits on, for background tasks that share the runner's lifetime.
    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// A token cancelled when the runner shuts down.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Start executing a queued job on its own task and return immediately.
    ///
    /// The record moves to [`JobStatus::Processing`] before this returns. Errors with
    /// [`ProcJobError::AlreadyDispatched`] if the job is not queued. Must be called from within a
    /// tokio runtime.
    pub fn dispatch(&self, id: JobId) -> Result<JobHandle, ProcJobError> {
        if self.tracker.is_closed() {
            return Err(ProcJobError::ShuttingDown);
        }
        let cancellation = self.shutdown.child_token();
        let (spec, started) = self
            .registry
            .update(&id, |record| {
                record
                    .mark_processing(cancellation.clone())
                    .map(|started| (record.spec().clone(), started))
            })?
            .ok_or(ProcJobError::JobNotFound(id))?
            .ok_or(ProcJobError::AlreadyDispatched(id))?;

        tracing::debug!(%id, command = %spec.command, "Dispatching job {id}");
        let execution = Execution {
            id,
            spec,
            started,
            timeout: self.config.timeout(),
            registry: self.registry.clone(),
            cancellation,
            shutdown: self.shutdown.clone(),
        };
        let handle = self.tracker.spawn(execution.run().in_current_span());
        Ok(JobHandle { id, handle })
    }

    /// Kill the job's process if it is still running and delete its record, whatever its status.
    pub fn cancel(&self, id: &JobId) -> Result<(), ProcJobError> {
        let record = self
            .registry
            .take(id)?
            .ok_or(ProcJobError::JobNotFound(*id))?;
        if let Some(cancellation) = record.cancellation() {
            cancellation.cancel();
        }
        tracing::info!(%id, status = %record.status(), "Cancelled job {id}");
        Ok(())
    }

    /// A snapshot of the job; the elapsed time of a processing job is computed on the spot.
    pub fn status(&self, id: &JobId) -> Result<Job, ProcJobError> {
        self.registry
            .get(id)?
            .ok_or(ProcJobError::JobNotFound(*id))
    }

    /// Stop accepting jobs, kill every running process and wait for their tasks to finish.
    ///
    /// Jobs interrupted this way are recorded as failed.
    pub async fn graceful_shutdown(&self) {
        tracing::debug!("Shutting down job runner");
        self.tracker.close();
        self.shutdown.cancel();
        self.tracker.wait().await;
    }
}

/// How long to wait for a killed process's pipes to close before giving up on the rest.
const KILL_GRACE: Duration = Duration::from_millis(100);

enum Exit {
    Exited(Captured),
    Cancelled { stderr: String },
    TimedOut { timeout: Duration, stderr: String },
}

struct Captured {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: String,
}

struct Execution {
    id: JobId,
    spec: JobSpec,
    started: Instant,
    timeout: Option<Duration>,
    registry: JobRegistry,
    cancellation: CancellationToken,
    shutdown: CancellationToken,
}

impl Execution {
    #[instrument(skip(self), fields(job_id = %self.id))]
    async fn run(self) -> RunOutcome {
        let job_id = self.id;
        let result = match self.execute().await {
            Ok(Exit::Exited(captured)) => self.collect(captured).await,
            Ok(Exit::Cancelled { .. }) if !self.shutdown.is_cancelled() => {
                tracing::info!(%job_id, "Job {job_id} cancelled, process killed");
                return RunOutcome::Cancelled;
            }
            Ok(Exit::Cancelled { stderr }) => {
                tracing::warn!(%job_id, "Job {job_id} interrupted by shutdown");
                Err(JobFailure::new(ExecutionError::Interrupted, stderr))
            }
            Ok(Exit::TimedOut { timeout, stderr }) => {
                tracing::warn!(%job_id, "Job {job_id} killed after exceeding timeout {timeout:?}");
                Err(JobFailure::new(ExecutionError::TimedOut(timeout), stderr))
            }
            Err(err) => {
                tracing::error!(%job_id, ?err, "Job {job_id} failed unexpectedly: {err}");
                Err(JobFailure::new(
                    ExecutionError::Unexpected(err.to_string()),
                    String::new(),
                ))
            }
        };
        self.record(result)
    }

    async fn execute(&self) -> Result<Exit, LaunchError> {
        if self.cancellation.is_cancelled() {
            return Ok(Exit::Cancelled {
                stderr: String::new(),
            });
        }
        let mut child = self
            .spec
            .command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.spec.command.program.clone(),
                source,
            })?;
        tracing::debug!(job_id = %self.id, pid = child.id(), "Launched `{}`", self.spec.command);

        let mut stdout = PipeCapture::spawn(child.stdout.take());
        let mut stderr = PipeCapture::spawn(child.stderr.take());
        let exited = async {
            let status = child.wait().await?;
            let (stdout, stderr) = tokio::try_join!(stdout.finish(), stderr.finish())?;
            Ok::<_, io::Error>(Captured {
                status,
                stdout,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        };
        let timed_out = tokio::select! {
            captured = exited => {
                return Ok(Exit::Exited(captured.map_err(LaunchError::Wait)?));
            }
            _ = self.cancellation.cancelled() => None,
            timeout = expire(self.timeout) => Some(timeout),
        };

        if let Err(err) = child.kill().await {
            tracing::warn!(job_id = %self.id, ?err, "Failed to kill process: {err}");
        }
        let stderr = String::from_utf8_lossy(&stderr.drain(KILL_GRACE).await).into_owned();
        Ok(match timed_out {
            Some(timeout) => Exit::TimedOut { timeout, stderr },
            None => Exit::Cancelled { stderr },
        })
    }

    async fn collect(&self, captured: Captured) -> Result<(JobOutput, Duration), JobFailure> {
        let elapsed = self.started.elapsed();
        let job_id = self.id;
        tracing::debug!(
            %job_id,
            status = %captured.status,
            stdout_bytes = captured.stdout.len(),
            "Process for job {job_id} exited after {elapsed:?}"
        );
        if !captured.status.success() {
            return Err(JobFailure::new(
                ExecutionError::CommandFailed {
                    exit_code: captured.status.code(),
                },
                captured.stderr,
            ));
        }
        let path = &self.spec.expected_output;
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok((
                JobOutput {
                    content,
                    filename: self.spec.output_filename(),
                    logs: captured.stderr,
                },
                elapsed,
            )),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(JobFailure::new(
                ExecutionError::MissingOutput,
                captured.stderr,
            )),
            Err(err) => Err(JobFailure::new(
                ExecutionError::Unexpected(read_error(path, &err)),
                captured.stderr,
            )),
        }
    }

    fn record(&self, result: Result<(JobOutput, Duration), JobFailure>) -> RunOutcome {
        let job_id = self.id;
        match &result {
            Ok(_) => tracing::info!(%job_id, "Job {job_id} complete"),
            Err(failure) => tracing::warn!(
                %job_id,
                error = %failure.error,
                "Job {job_id} failed: {}",
                failure.error
            ),
        }
        match self.registry.update(&job_id, |record| record.finish(result)) {
            Ok(Some(Some(status))) => RunOutcome::Finished(status),
            Ok(_) => {
                tracing::info!(%job_id, "Job {job_id} was cancelled before its result was recorded");
                RunOutcome::Cancelled
            }
            Err(err) => {
                tracing::error!(%job_id, ?err, "Failed to record result of job {job_id}: {err}");
                RunOutcome::Abandoned
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum LaunchError {
    #[error("failed to launch {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("failed waiting for process: {0}")]
    Wait(io::Error),
}

/// A child's output pipe read on a task of its own.
///
/// The bytes live in a buffer shared with the reader, so whatever the process wrote before it was
/// killed can still be collected.
struct PipeCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<io::Result<()>>>,
}

impl PipeCapture {
    fn spawn(pipe: Option<impl AsyncRead + Unpin + Send + 'static>) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let reader = pipe.map(|mut pipe| {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut chunk = [0; 8192];
                loop {
                    let read = pipe.read(&mut chunk).await?;
                    if read == 0 {
                        return Ok(());
                    }
                    buffer.lock().await.extend_from_slice(&chunk[..read]);
                }
            })
        });
        Self { buffer, reader }
    }

    /// Wait for the pipe to close and take everything read from it.
    async fn finish(&mut self) -> io::Result<Vec<u8>> {
        if let Some(reader) = self.reader.as_mut() {
            let result = reader.await;
            self.reader = None;
            result??;
        }
        Ok(std::mem::take(&mut *self.buffer.lock().await))
    }

    /// Take whatever was read so far, giving the pipe at most `grace` to close.
    async fn drain(mut self, grace: Duration) -> Vec<u8> {
        if let Some(reader) = self.reader.take() {
            let abort = reader.abort_handle();
            if tokio::time::timeout(grace, reader).await.is_err() {
                // A grandchild still holds the pipe open.
                abort.abort();
            }
        }
        std::mem::take(&mut *self.buffer.lock().await)
    }
}

impl Drop for PipeCapture {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn expire(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(timeout) => {
            tokio::time::sleep(timeout).await;
            timeout
        }
        None => std::future::pending().await,
    }
}

fn read_error(path: &Path, err: &io::Error) -> String {
    format!("failed to read output file {}: {err}", path.display())
}
