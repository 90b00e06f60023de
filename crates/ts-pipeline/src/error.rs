use thiserror::Error;

/// Common error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("processing error: {0}")]
    Processing(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("stage `{stage}` failed to start: {source}")]
    StageStart {
        stage: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("stage `{stage}` failed: {source}")]
    StageProcess {
        stage: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl PipelineError {
    /// Wrap a stage failure with the stage name.
    pub(crate) fn in_stage(stage: &'static str, source: PipelineError) -> PipelineError {
        match source {
            already @ (PipelineError::StageStart { .. } | PipelineError::StageProcess { .. }) => {
                already
            }
            other => PipelineError::StageProcess {
                stage,
                source: Box::new(other),
            },
        }
    }
}
