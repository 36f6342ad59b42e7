//! Error taxonomy shared by all commands.

use std::path::PathBuf;

use thiserror::Error;

pub type CifuzzResult<T> = Result<T, CifuzzError>;

/// Exit code when the fuzzing engine itself reported an issue.
pub const FUZZING_ERROR_EXIT_CODE: u8 = 77;

/// Exit code when a sanitizer reported an issue.
pub const SANITIZER_ERROR_EXIT_CODE: u8 = 78;

#[derive(Debug, Error)]
pub enum CifuzzError {
    /// Malformed flags or arguments. Printed verbatim, no context chain.
    #[error("{0}")]
    Usage(String),

    /// Invalid cifuzz.yaml, unknown build system or a missing host tool.
    #[error("{0}")]
    Config(String),

    /// An external build tool failed. Its stderr has already been streamed
    /// to the user, so the message only repeats the command line.
    #[error("build command failed: {command} (in {})", cwd.display())]
    Build { command: String, cwd: PathBuf },

    /// The fuzzer child process could not be launched or exited with an
    /// exit code that is not part of the engine contract.
    #[error("{message}\ncommand: {command}")]
    Runner { command: String, message: String },

    /// The run was terminated because the engine or a sanitizer found an
    /// issue. Not a failure of cifuzz itself.
    #[error("fuzz test found an issue")]
    FindingSignalled { exit_code: u8 },

    /// The user interrupted the run.
    #[error("received signal {}", signal_name(*.0))]
    Signal(i32),

    /// A request to the remote fuzzing server failed.
    #[error("{0}")]
    Api(String),

    /// A branch that should be unreachable.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Zip(#[from] zip::result::ZipError),
}

impl CifuzzError {
    /// Maps the error to the process exit code documented for the CLI:
    /// 77 for engine findings, 78 for sanitizer findings, 128+signum after
    /// a signal, 1 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            CifuzzError::FindingSignalled { exit_code } => *exit_code,
            CifuzzError::Signal(signal) => 128u8.wrapping_add(*signal as u8),
            _ => 1,
        }
    }
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        2 => "SIGINT",
        3 => "SIGQUIT",
        15 => "SIGTERM",
        _ => "signal",
    }
}
