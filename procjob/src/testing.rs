//! Helpers for testing code that runs jobs.
use std::time::Duration;

use crate::{
    job::{command::CommandSpec, Job, JobId},
    JobManager, ProcJobError,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A command running `script` with `/bin/sh -c`.
pub fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh").args(["-c", script])
}

/// Poll the job until it reaches a terminal status or `timeout` elapses.
///
/// Returns the last snapshot observed, which is only non terminal when the timeout was hit.
pub async fn wait_for_terminal(
    manager: &JobManager,
    id: &JobId,
    timeout: Duration,
) -> Result<Job, ProcJobError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = manager.status(id)?;
        if job.status().is_terminal() || tokio::time::Instant::now() >= deadline {
            return Ok(job);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// A macro for making assertions about the state of a job.
///
/// Waits for the job to reach a terminal status first (5 seconds at most), then checks every
/// given property of the snapshot.
///
/// # Example
///
/// ```
/// # use procjob::prelude::*;
/// # use procjob::testing::{assert_job, sh};
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let manager = JobManager::default();
/// let id = manager
///     .submit(JobSpec::new(sh("echo 'unknown model' >&2; exit 2"), "out.txt"))
///     .unwrap();
///
/// assert_job!(
///     manager,
///     id,
///     status: JobStatus::Error,
///     error: "command failed",
///     logs: "unknown model\n"
/// );
/// # manager.graceful_shutdown().await;
/// # });
/// ```
#[macro_export]
macro_rules! assert_job {
    ($manager:expr, $id:expr, $($tail:tt)*) => {{
        let job = $crate::testing::wait_for_terminal(
            &$manager,
            &$id,
            ::std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
        $crate::assert_job!(@check job; $($tail)*);
    }};
    (@check $job:ident;) => {};
    (@check $job:ident; status: $status:expr $(, $($tail:tt)*)?) => {
        assert_eq!($job.status(), $status, "Unexpected status for job:\n{:#?}", $job);
        $($crate::assert_job!(@check $job; $($tail)*);)?
    };
    (@check $job:ident; output: $output:expr $(, $($tail:tt)*)?) => {
        assert_eq!(
            $job.output().map(|output| output.content.as_str()),
            Some($output),
            "Unexpected output for job:\n{:#?}",
            $job
        );
        $($crate::assert_job!(@check $job; $($tail)*);)?
    };
    (@check $job:ident; filename: $filename:expr $(, $($tail:tt)*)?) => {
        assert_eq!(
            $job.output().map(|output| output.filename.as_str()),
            Some($filename),
            "Unexpected filename for job:\n{:#?}",
            $job
        );
        $($crate::assert_job!(@check $job; $($tail)*);)?
    };
    (@check $job:ident; error: $reason:expr $(, $($tail:tt)*)?) => {
        assert_eq!(
            $job.failure().map(|failure| failure.reason()).as_deref(),
            Some($reason),
            "Unexpected error for job:\n{:#?}",
            $job
        );
        $($crate::assert_job!(@check $job; $($tail)*);)?
    };
    (@check $job:ident; logs: $logs:expr $(, $($tail:tt)*)?) => {
        let logs = $job
            .output()
            .map(|output| output.logs.as_str())
            .or_else(|| $job.failure().map(|failure| failure.logs.as_str()));
        assert_eq!(logs, Some($logs), "Unexpected logs for job:\n{:#?}", $job);
        $($crate::assert_job!(@check $job; $($tail)*);)?
    };
}

pub use assert_job;
