use thiserror::Error;

/// Failure categories of a remediation run.
#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("administrative rights unavailable: {0}")]
    Elevation(String),

    #[error("post-condition not met: {0}")]
    Precondition(String),

    #[error("resume point could not be persisted: {0}")]
    Persistence(String),

    #[error("external tool still busy after {attempts} attempts: {detail}")]
    TransientTool { attempts: u32, detail: String },

    #[error("advisory check failed: {0}")]
    Advisory(String),

    #[error("{failed} of {attempted} removals failed")]
    PartialBatch { attempted: usize, failed: usize },

    #[error("command failed: {0}")]
    Command(String),

    #[error("unsupported platform")]
    Unsupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("journal error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("download error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RemediationError {
    /// Short category tag used in the journal and operator messages.
    pub fn category(&self) -> &'static str {
        match self {
            RemediationError::Elevation(_) => "ELEVATION",
            RemediationError::Precondition(_) => "PRECONDITION",
            RemediationError::Persistence(_) => "PERSISTENCE",
            RemediationError::TransientTool { .. } => "TRANSIENT_TOOL",
            RemediationError::Advisory(_) => "ADVISORY",
            RemediationError::PartialBatch { .. } => "PARTIAL_BATCH",
            RemediationError::Command(_) => "COMMAND",
            RemediationError::Unsupported => "UNSUPPORTED",
            RemediationError::Io(_) => "IO",
            RemediationError::Json(_) => "SERIALIZATION",
            RemediationError::Sql(_) => "JOURNAL",
            RemediationError::Http(_) => "DOWNLOAD",
        }
    }
}

pub type RemediationResult<T> = Result<T, RemediationError>;
