use thiserror::Error;

/// Result type for throttled pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced to the caller of a top-level API.
///
/// Per-item failures never show up here; they are recorded as
/// [`ProcessingError`] inside result records.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid construction parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// `run` called while a previous run on the same pipeline is active
    #[error("Pipeline is already running")]
    AlreadyRunning,

    /// A worker task or thread died outside the processor boundary
    #[error("Task join error: {0}")]
    TaskJoin(String),

    /// Config file could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Logging subscriber setup failed
    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LogError),
}

impl PipelineError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Failure of a single work item or batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// The processor returned an error
    #[error("processing failed: {0}")]
    Failed(String),

    /// The processor panicked
    #[error("processor panicked: {0}")]
    Panicked(String),

    /// The run was cancelled before the item was processed
    #[error("cancelled before processing")]
    Cancelled,
}

impl ProcessingError {
    /// Build a `Failed` error from anything displayable.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(msg)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
