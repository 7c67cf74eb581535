//! Runs a single job through procjob and prints its status as JSON until it finishes.
//!
//! ```text
//! procjob-transcribe transcribe recording.mp3 --model small --output-dir transcripts
//! procjob-transcribe run --output out.txt -- sh -c 'sleep 2 && echo hi > out.txt'
//! ```
//!
//! Ctrl-C cancels the job.
use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use procjob::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "procjob-transcribe")]
#[command(about = "Run an external command as a tracked job", long_about = None)]
struct Cli {
    /// Kill the job if it runs longer than this many seconds
    #[arg(long, env = "PROCJOB_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// How often to poll the job's status
    #[arg(
        long,
        env = "PROCJOB_POLL_MILLIS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_millis: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transcribe an audio file with whisper
    Transcribe {
        input: PathBuf,
        #[arg(long, env = "PROCJOB_OUTPUT_DIR", default_value = "outputs")]
        output_dir: PathBuf,
        #[arg(long, default_value = "whisper")]
        program: String,
        #[arg(long, default_value = "base")]
        model: String,
        /// Spoken language, detected by whisper when omitted or "auto"
        #[arg(long)]
        language: Option<String>,
        #[arg(long, default_value = "transcribe")]
        task: String,
        #[arg(long, default_value = "txt")]
        output_format: String,
        #[arg(long, default_value_t = 0.0)]
        temperature: f32,
        #[arg(long, default_value_t = 5)]
        beam_size: u32,
        #[arg(long)]
        patience: Option<f32>,
    },
    /// Run an arbitrary command which writes its result to `output`
    Run {
        #[arg(long)]
        output: PathBuf,
        /// The program followed by its arguments, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

impl Commands {
    fn into_job_spec(self) -> Result<JobSpec> {
        match self {
            Commands::Transcribe {
                input,
                output_dir,
                program,
                model,
                language,
                task,
                output_format,
                temperature,
                beam_size,
                patience,
            } => {
                std::fs::create_dir_all(&output_dir).with_context(|| {
                    format!("Failed to create output dir {}", output_dir.display())
                })?;
                let mut request = TranscriptionRequest::default()
                    .with_program(program)
                    .with_model(model)
                    .with_task(task)
                    .with_output_format(output_format)
                    .with_temperature(temperature)
                    .with_beam_size(beam_size);
                if let Some(language) = language {
                    request = request.with_language(language);
                }
                if let Some(patience) = patience {
                    request = request.with_patience(patience);
                }
                Ok(request.into_job_spec(input, output_dir)?)
            }
            Commands::Run { output, command } => {
                let (program, args) = command
                    .split_first()
                    .context("No command given to run")?;
                Ok(JobSpec::new(
                    CommandSpec::new(program).args(args.iter().cloned()),
                    output,
                ))
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "procjob=info,procjob_transcribe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = RunnerConfig::new();
    if let Some(timeout) = cli.timeout_secs {
        config = config.with_timeout(Duration::from_secs(timeout));
    }
    let manager = JobManager::new(config)?;

    let spec = cli.command.into_job_spec()?;
    tracing::info!(command = %spec.command, "Submitting job");
    let id = manager.submit(spec)?;
    println!("{}", serde_json::json!({ "task_id": id, "status": JobStatus::Queued }));

    let job = poll(&manager, &id, Duration::from_millis(cli.poll_millis)).await?;
    manager.graceful_shutdown().await;

    match job {
        Some(job) if job.status() == JobStatus::Complete => Ok(()),
        Some(job) => {
            let reason = job.failure().map(JobFailure::reason).unwrap_or_default();
            anyhow::bail!("Job {id} failed: {reason}")
        }
        None => anyhow::bail!("Job {id} cancelled"),
    }
}

/// Print every snapshot of the job until it is terminal, or `None` if cancelled with Ctrl-C.
async fn poll(manager: &JobManager, id: &JobId, interval: Duration) -> Result<Option<Job>> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let job = manager.status(id)?;
                println!("{}", serde_json::to_string(&job)?);
                if job.status().is_terminal() {
                    return Ok(Some(job));
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::warn!(%id, "Interrupted, cancelling job {id}");
                manager.cancel(id)?;
                return Ok(None);
            }
        }
    }
}
