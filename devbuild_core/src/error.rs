//! Error taxonomy for dev build operations.

/// Result alias used by the lifecycle services.
pub type Result<T> = std::result::Result<T, DevBuildError>;

/// Errors surfaced to callers of the lifecycle services.
#[derive(Debug, thiserror::Error)]
pub enum DevBuildError {
    /// The request failed validation (field patterns, engine/edition mismatch,
    /// cross-field constraints).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The caller may not set a privileged field.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No build record exists with this id.
    #[error("build {0} not found")]
    NotFound(i64),

    /// The job system or source-control provider explicitly refused the call.
    #[error("upstream rejected the request, please wait and retry later: {0}")]
    UpstreamRejected(String),

    /// Persistence failure, concurrency conflict or unexpected upstream failure.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl DevBuildError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps a lower-level failure (usually from the record store).
    pub fn internal_from(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Maps a backend client failure onto the caller-facing taxonomy.
    pub fn from_client(context: &str, err: ClientError) -> Self {
        match err {
            ClientError::Rejected(reason) => Self::UpstreamRejected(format!("{context}: {reason}")),
            ClientError::Other(source) => Self::internal_from(context.to_string(), source),
        }
    }

    /// Stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::UpstreamRejected(_) => "upstream_rejected",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Failure reported by a backend client port (job system, source control,
/// fan-out trigger sink).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The remote system refused the request (e.g. HTTP 422).
    #[error("rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
