use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeirError {
    // Definition errors, surfaced before any Run is created
    #[error("Workflow validation failed: {0}")]
    Validation(String),

    #[error("Workflow contains a dependency cycle through: {}", nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    // Invocation errors
    #[error("Agent call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Transient execution failure: {0}")]
    Transient(String),

    #[error("Permanent execution failure: {0}")]
    Permanent(String),

    #[error("Approval rejected: {reason}")]
    ApprovalRejected { reason: String },

    #[error("Agent not registered: {0}")]
    UnknownAgent(String),

    // Execution environment errors
    #[error("Environment build failed: {0}")]
    Build(String),

    #[error("Environment start failed: {0}")]
    Start(String),

    // Engine errors
    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WeirError>;

/// Coarse failure class recorded on a NodeRun and used to decide retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Transient,
    Permanent,
    ApprovalRejected,
    Build,
    Start,
    InternalConsistency,
    Cancelled,
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::ApprovalRejected => "approval_rejected",
            FailureKind::Build => "build",
            FailureKind::Start => "start",
            FailureKind::InternalConsistency => "internal_consistency",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(FailureKind::Timeout),
            "transient" => Ok(FailureKind::Transient),
            "permanent" => Ok(FailureKind::Permanent),
            "approval_rejected" => Ok(FailureKind::ApprovalRejected),
            "build" => Ok(FailureKind::Build),
            "start" => Ok(FailureKind::Start),
            "internal_consistency" => Ok(FailureKind::InternalConsistency),
            "cancelled" => Ok(FailureKind::Cancelled),
            "other" => Ok(FailureKind::Other),
            _ => Err(format!("unknown failure kind: {}", s)),
        }
    }
}

impl WeirError {
    /// Classify this error for the NodeRun record.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            WeirError::Timeout { .. } => FailureKind::Timeout,
            WeirError::Transient(_) => FailureKind::Transient,
            WeirError::Permanent(_) => FailureKind::Permanent,
            WeirError::ApprovalRejected { .. } => FailureKind::ApprovalRejected,
            WeirError::Build(_) => FailureKind::Build,
            WeirError::Start(_) => FailureKind::Start,
            WeirError::InternalConsistency(_) => FailureKind::InternalConsistency,
            WeirError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Other,
        }
    }

    /// Only timeouts and transient failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WeirError::Timeout { .. } | WeirError::Transient(_))
    }
}
