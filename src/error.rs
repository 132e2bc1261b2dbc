use thiserror::Error;

/// Upstream stage at which a proxied request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStage {
    Dial,
    Tls,
    Write,
    Read,
    Timeout,
}

impl UpstreamStage {
    /// Wire code surfaced in `X-Resin-Error` and request logs.
    pub fn code(&self) -> &'static str {
        match self {
            UpstreamStage::Dial => "UPSTREAM_DIAL",
            UpstreamStage::Tls => "UPSTREAM_TLS",
            UpstreamStage::Write => "UPSTREAM_WRITE",
            UpstreamStage::Read => "UPSTREAM_READ",
            UpstreamStage::Timeout => "UPSTREAM_TIMEOUT",
        }
    }
}

impl std::fmt::Display for UpstreamStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpstreamStage::Dial => "dial",
            UpstreamStage::Tls => "tls",
            UpstreamStage::Write => "write",
            UpstreamStage::Read => "read",
            UpstreamStage::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum ResinError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no healthy node: {0}")]
    NoHealthyNode(String),

    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("upstream {stage} error: {message}")]
    Upstream {
        stage: UpstreamStage,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ResinError {
    pub fn upstream(stage: UpstreamStage, message: impl Into<String>) -> Self {
        ResinError::Upstream {
            stage,
            message: message.into(),
        }
    }

    /// Stable wire code for the `X-Resin-Error` header and error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ResinError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ResinError::NotFound(_) => "NOT_FOUND",
            ResinError::Conflict(_) => "CONFLICT",
            ResinError::NoHealthyNode(_) => "NO_HEALTHY_NODE",
            ResinError::AuthFailed(_) => "AUTH_FAILED",
            ResinError::Upstream { stage, .. } => stage.code(),
            ResinError::Storage(_)
            | ResinError::Serialization(_)
            | ResinError::Io(_)
            | ResinError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status the control plane answers with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ResinError::InvalidArgument(_) => 400,
            ResinError::AuthFailed(_) => 403,
            ResinError::NotFound(_) => 404,
            ResinError::Conflict(_) => 409,
            ResinError::NoHealthyNode(_) => 503,
            ResinError::Upstream { .. } => 502,
            ResinError::Storage(_)
            | ResinError::Serialization(_)
            | ResinError::Io(_)
            | ResinError::Internal(_) => 500,
        }
    }
}

impl From<serde_json::Error> for ResinError {
    fn from(e: serde_json::Error) -> Self {
        ResinError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ResinError>;
