use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use crate::ProcJobError;

use super::JobSpec;

/// A fully resolved external command: the program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(self, arg: impl Into<String>) -> Self {
        let mut args = self.args;
        args.push(arg.into());
        Self { args, ..self }
    }

    pub fn args(self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut existing = self.args;
        existing.extend(args.into_iter().map(Into::into));
        Self {
            args: existing,
            ..self
        }
    }

    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Builds the whisper command line for transcribing (or translating) an audio file.
///
/// ```
/// use procjob::job::command::TranscriptionRequest;
///
/// let spec = TranscriptionRequest::default()
///     .with_model("small")
///     .with_language("de")
///     .into_job_spec("uploads/interview.mp3", "outputs")
///     .unwrap();
///
/// assert_eq!(spec.expected_output, std::path::Path::new("outputs/interview.txt"));
/// assert!(spec.command.args.contains(&"--language".to_owned()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionRequest {
    program: String,
    model: String,
    language: Option<String>,
    task: String,
    output_format: String,
    temperature: f32,
    beam_size: u32,
    patience: Option<f32>,
}

impl Default for TranscriptionRequest {
    fn default() -> Self {
        Self {
            program: "whisper".to_owned(),
            model: "base".to_owned(),
            language: None,
            task: "transcribe".to_owned(),
            output_format: "txt".to_owned(),
            temperature: 0.0,
            beam_size: 5,
            patience: None,
        }
    }
}

impl TranscriptionRequest {
    /// Use a different executable than `whisper` found on the `PATH`.
    pub fn with_program(self, program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..self
        }
    }

    pub fn with_model(self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self
        }
    }

    /// `"auto"` is treated the same as no language, leaving detection to whisper.
    pub fn with_language(self, language: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
            ..self
        }
    }

    pub fn with_task(self, task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..self
        }
    }

    pub fn with_output_format(self, output_format: impl Into<String>) -> Self {
        Self {
            output_format: output_format.into(),
            ..self
        }
    }

    pub fn with_temperature(self, temperature: f32) -> Self {
        Self {
            temperature,
            ..self
        }
    }

    pub fn with_beam_size(self, beam_size: u32) -> Self {
        Self { beam_size, ..self }
    }

    pub fn with_patience(self, patience: f32) -> Self {
        Self {
            patience: Some(patience),
            ..self
        }
    }

    /// Resolve the command for `input` writing into `output_dir`.
    ///
    /// The expected output is `<output_dir>/<input stem>.<output_format>`, which is where whisper
    /// writes its result.
    pub fn into_job_spec(
        self,
        input: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
    ) -> Result<JobSpec, ProcJobError> {
        let input = input.as_ref();
        let output_dir = output_dir.as_ref();
        let stem = input
            .file_stem()
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                ProcJobError::InvalidInput(format!("{} has no file name", input.display()))
            })?
            .to_string_lossy()
            .into_owned();
        let expected_output: PathBuf =
            output_dir.join(format!("{stem}.{}", self.output_format));

        let mut command = CommandSpec::new(self.program)
            .arg(input.to_string_lossy())
            .args(["--model", self.model.as_str()])
            .args(["--output_dir".to_owned(), output_dir.to_string_lossy().into_owned()])
            .args(["--output_format", self.output_format.as_str()])
            .args(["--task", self.task.as_str()])
            .args(["--temperature".to_owned(), format!("{:?}", self.temperature)])
            .args(["--beam_size".to_owned(), self.beam_size.to_string()])
            .args(["--verbose", "False"]);

        if let Some(language) = self.language.filter(|language| language != "auto") {
            command = command.args(["--language".to_owned(), language]);
        }
        if let Some(patience) = self.patience {
            command = command.args(["--patience".to_owned(), format!("{patience:?}")]);
        }

        Ok(JobSpec {
            command,
            expected_output,
        })
    }
}
