//! The types describing a job and the snapshots handed out when polling one.
//!
//! A job is a single invocation of an external command together with the path of the file that
//! command is expected to produce. Callers never hold on to the live record, instead they receive
//! a [`Job`] snapshot whose [`JobProgress`] carries exactly the data valid for its status.
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

pub mod command;

use command::CommandSpec;

/// The opaque identifier of a job.
///
/// Identifiers are random (UUID v4) and generated when the job is created.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Everything needed to run a job: the command and where its output will appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub command: CommandSpec,
    pub expected_output: PathBuf,
}

impl JobSpec {
    pub fn new(command: CommandSpec, expected_output: impl Into<PathBuf>) -> Self {
        Self {
            command,
            expected_output: expected_output.into(),
        }
    }

    /// The file name reported back to callers once the job completes.
    pub fn output_filename(&self) -> String {
        self.expected_output
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// Whether no further automatic transition will happen for a job in this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The reason a job ended in [`JobStatus::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("command failed")]
    CommandFailed { exit_code: Option<i32> },
    #[error("output file not found")]
    MissingOutput,
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("runner shut down")]
    Interrupted,
    #[error("{0}")]
    Unexpected(String),
}

/// The data recorded for a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    /// The full contents of the expected output file.
    pub content: String,
    pub filename: String,
    /// Everything the command wrote to its standard error.
    pub logs: String,
}

/// The data recorded for a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub error: ExecutionError,
    /// Everything the command wrote to its standard error, when it got far enough to produce any.
    pub logs: String,
}

impl JobFailure {
    pub fn new(error: ExecutionError, logs: impl Into<String>) -> Self {
        Self {
            error,
            logs: logs.into(),
        }
    }

    /// The human readable failure reason.
    pub fn reason(&self) -> String {
        self.error.to_string()
    }
}

/// The status of a job together with the data valid for that status.
#[derive(Debug, Clone, PartialEq)]
pub enum JobProgress {
    Queued,
    /// The elapsed time is computed at the moment the snapshot was taken.
    Processing { elapsed: Duration },
    Complete { output: JobOutput, elapsed: Duration },
    Error { failure: JobFailure },
}

impl JobProgress {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Queued => JobStatus::Queued,
            Self::Processing { .. } => JobStatus::Processing,
            Self::Complete { .. } => JobStatus::Complete,
            Self::Error { .. } => JobStatus::Error,
        }
    }
}

/// A point in time snapshot of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub inserted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        self.progress.status()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        match self.progress {
            JobProgress::Processing { elapsed } | JobProgress::Complete { elapsed, .. } => {
                Some(elapsed)
            }
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&JobOutput> {
        match &self.progress {
            JobProgress::Complete { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match &self.progress {
            JobProgress::Error { failure } => Some(failure),
            _ => None,
        }
    }
}

// Flat layout so a polling client only ever looks at the fields its status implies.
impl Serialize for Job {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("task_id", &self.id)?;
        map.serialize_entry("status", &self.status())?;
        map.serialize_entry("inserted_at", &self.inserted_at)?;
        if let Some(started_at) = &self.started_at {
            map.serialize_entry("started_at", started_at)?;
        }
        if let Some(finished_at) = &self.finished_at {
            map.serialize_entry("finished_at", finished_at)?;
        }
        match &self.progress {
            JobProgress::Queued => {}
            JobProgress::Processing { elapsed } => {
                map.serialize_entry("elapsed_time", &elapsed.as_secs_f64())?;
            }
            JobProgress::Complete { output, elapsed } => {
                map.serialize_entry("output", &output.content)?;
                map.serialize_entry("filename", &output.filename)?;
                map.serialize_entry("logs", &output.logs)?;
                map.serialize_entry("elapsed_time", &elapsed.as_secs_f64())?;
            }
            JobProgress::Error { failure } => {
                map.serialize_entry("error", &failure.reason())?;
                map.serialize_entry("logs", &failure.logs)?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn job(progress: JobProgress) -> Job {
        Job {
            id: JobId::new(),
            spec: JobSpec::new(CommandSpec::new("true"), "/tmp/outputs/audio.txt"),
            inserted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress,
        }
    }

    #[test]
    fn job_id_parses_its_own_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_matches!("not-a-uuid".parse::<JobId>(), Err(_));
    }

    #[test]
    fn output_filename_is_last_path_component() {
        let spec = JobSpec::new(CommandSpec::new("true"), "outputs/lecture.srt");
        assert_eq!(spec.output_filename(), "lecture.srt");

        let spec = JobSpec::new(CommandSpec::new("true"), "/");
        assert_eq!(spec.output_filename(), "");
    }

    #[test]
    fn only_complete_and_error_are_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Error.is_terminal());
    }

    #[test]
    fn failure_reasons() {
        let failure = JobFailure::new(ExecutionError::CommandFailed { exit_code: Some(1) }, "");
        assert_eq!(failure.reason(), "command failed");
        let failure = JobFailure::new(ExecutionError::MissingOutput, "");
        assert_eq!(failure.reason(), "output file not found");
        let failure = JobFailure::new(ExecutionError::Unexpected("boom".to_owned()), "");
        assert_eq!(failure.reason(), "boom");
    }

    #[test]
    fn serializes_processing_with_elapsed_time() {
        let job = job(JobProgress::Processing {
            elapsed: Duration::from_millis(1500),
        });
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["status"], json!("processing"));
        assert_eq!(value["elapsed_time"], json!(1.5));
        assert_eq!(value["task_id"], json!(job.id.to_string()));
        assert!(value.get("output").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn serializes_complete_with_output_fields() {
        let job = job(JobProgress::Complete {
            output: JobOutput {
                content: "hello".to_owned(),
                filename: "audio.txt".to_owned(),
                logs: "100%".to_owned(),
            },
            elapsed: Duration::from_secs(2),
        });
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["status"], json!("complete"));
        assert_eq!(value["output"], json!("hello"));
        assert_eq!(value["filename"], json!("audio.txt"));
        assert_eq!(value["logs"], json!("100%"));
        assert_eq!(value["elapsed_time"], json!(2.0));
    }

    #[test]
    fn serializes_error_with_reason_and_logs() {
        let job = job(JobProgress::Error {
            failure: JobFailure::new(
                ExecutionError::CommandFailed { exit_code: Some(2) },
                "unknown model",
            ),
        });
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["error"], json!("command failed"));
        assert_eq!(value["logs"], json!("unknown model"));
        assert!(value.get("elapsed_time").is_none());
    }

    #[test]
    fn accessors_follow_progress() {
        let queued = job(JobProgress::Queued);
        assert_eq!(queued.status(), JobStatus::Queued);
        assert_eq!(queued.elapsed(), None);
        assert_eq!(queued.output(), None);
        assert_eq!(queued.failure(), None);

        let failed = job(JobProgress::Error {
            failure: JobFailure::new(ExecutionError::MissingOutput, ""),
        });
        assert_matches!(
            failed.failure(),
            Some(JobFailure {
                error: ExecutionError::MissingOutput,
                ..
            })
        );
    }
}
