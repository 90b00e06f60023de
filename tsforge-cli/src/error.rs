use thiserror::Error;
use ts_pipeline::PipelineError;

/// Top-level errors of the tool.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Usage(#[from] clap::Error),

    #[error("{0}")]
    Invalid(String),

    #[error("unknown {kind} plugin `{name}`")]
    UnknownPlugin { kind: String, name: String },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl CliError {
    /// Process exit code: 2 for usage errors, 1 for runtime failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) | CliError::Invalid(_) | CliError::UnknownPlugin { .. } => 2,
            CliError::Pipeline(_) => 1,
        }
    }
}
