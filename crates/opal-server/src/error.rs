// crates/opal-server/src/error.rs
// Standardized error types for Opal

use opal_types::{ErrorKind, ToolError};
use thiserror::Error;

/// Main error type for the Opal library
#[derive(Error, Debug)]
pub enum OpalError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("protected: {0}")]
    Protected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using OpalError
pub type Result<T> = std::result::Result<T, OpalError>;

impl OpalError {
    /// Map onto the stable wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpalError::Validation(_) => ErrorKind::Validation,
            OpalError::NotFound(_) => ErrorKind::NotFound,
            OpalError::Conflict(_) => ErrorKind::Conflict,
            OpalError::Protected(_) => ErrorKind::Protected,
            OpalError::Io(_) => ErrorKind::Io,
            OpalError::Json(_) | OpalError::Yaml(_) => ErrorKind::Parse,
            OpalError::Cancelled => ErrorKind::Cancelled,
            OpalError::Timeout(_) => ErrorKind::Timeout,
            OpalError::Config(_) => ErrorKind::Validation,
            OpalError::Other(_) | OpalError::Anyhow(_) => ErrorKind::Internal,
        }
    }

    /// Convert to the structured error every tool boundary reports.
    pub fn into_tool_error(self) -> ToolError {
        ToolError::new(self.kind(), self.to_string())
    }
}

impl From<String> for OpalError {
    fn from(s: String) -> Self {
        OpalError::Other(s)
    }
}

impl From<tokio::task::JoinError> for OpalError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            OpalError::Cancelled
        } else {
            OpalError::Other(err.to_string())
        }
    }
}

impl From<OpalError> for String {
    fn from(err: OpalError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(OpalError::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(OpalError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(OpalError::Protected("x".into()).kind(), ErrorKind::Protected);
        assert_eq!(OpalError::Cancelled.kind(), ErrorKind::Cancelled);
        let parse: OpalError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(parse.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_into_tool_error_preserves_kind() {
        let err = OpalError::Conflict("tool 'x' already registered".into());
        let tool_err = err.into_tool_error();
        assert_eq!(tool_err.kind, ErrorKind::Conflict);
        assert!(tool_err.message.contains("already registered"));
    }
}
