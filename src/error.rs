//! Error types for the millrace pipeline engine.
//!
//! This module defines the error types used throughout the millrace crate,
//! following the non-exhaustive enum pattern to allow future error variants
//! without breaking compatibility.

use thiserror::Error;

/// The main error type for millrace operations.
///
/// This enum uses `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking backward compatibility.
///
/// Processing failures raised by user transition functions are *not*
/// represented here: the engine captures those and materializes them as
/// error documents (see [`crate::ProcessError`]). The variants below are
/// the faults the engine itself reports to callers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MillraceError {
    /// Invalid configuration: a malformed state machine, an unknown state
    /// on add, a missing document type, or bad call arguments.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Error raised by the persistence backend.
    #[error("Repository error: {0}")]
    Repository(String),

    /// A write collided with existing data (duplicate id, re-parenting).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The named document does not exist.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// The named document exists but carries no content.
    #[error("Document has no content: {0}")]
    NoContent(String),

    /// The operation is forbidden while `next`/`finish` are in flight.
    #[error("Engine busy: {0}")]
    Busy(String),

    /// A spawned hop task failed to join (panic or abort).
    #[error("Task error: {0}")]
    Task(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from file or database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MillraceError {
    /// Returns a short, stable label for the error variant.
    pub fn kind(&self) -> &'static str {
        match self {
            MillraceError::Configuration(_) => "configuration",
            MillraceError::Repository(_) => "repository",
            MillraceError::Conflict(_) => "conflict",
            MillraceError::NotFound(_) => "not_found",
            MillraceError::NoContent(_) => "no_content",
            MillraceError::Busy(_) => "busy",
            MillraceError::Task(_) => "task",
            MillraceError::Serialization(_) => "serialization",
            MillraceError::Io(_) => "io",
        }
    }
}

/// A specialized `Result` type for millrace operations.
///
/// This is a type alias for `std::result::Result<T, MillraceError>` to
/// reduce boilerplate in function signatures throughout the crate.
pub type Result<T> = std::result::Result<T, MillraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_configuration() {
        let error = MillraceError::Configuration("document type not set".to_string());
        assert_eq!(
            error.to_string(),
            "Configuration error: document type not set"
        );
    }

    #[test]
    fn test_error_display_repository() {
        let error = MillraceError::Repository("connection failed".to_string());
        assert_eq!(error.to_string(), "Repository error: connection failed");
    }

    #[test]
    fn test_error_display_conflict() {
        let error = MillraceError::Conflict("duplicate id doc-1".to_string());
        assert_eq!(error.to_string(), "Conflict: duplicate id doc-1");
    }

    #[test]
    fn test_error_display_not_found() {
        let error = MillraceError::NotFound("doc-123".to_string());
        assert_eq!(error.to_string(), "Document not found: doc-123");
    }

    #[test]
    fn test_error_display_no_content() {
        let error = MillraceError::NoContent("doc-123".to_string());
        assert_eq!(error.to_string(), "Document has no content: doc-123");
    }

    #[test]
    fn test_error_display_busy() {
        let error = MillraceError::Busy("pipeline in progress".to_string());
        assert_eq!(error.to_string(), "Engine busy: pipeline in progress");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let millrace_error: MillraceError = json_error.into();
        assert!(millrace_error.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let millrace_error: MillraceError = io_error.into();
        assert!(millrace_error.to_string().contains("I/O error"));
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(MillraceError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(MillraceError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(MillraceError::Busy("x".into()).kind(), "busy");
    }

    #[test]
    fn test_result_ok() {
        let result: Result<i32> = Ok(42);
        assert!(result.is_ok());
        assert_eq!(result.ok(), Some(42));
    }

    #[test]
    fn test_error_debug_format() {
        let error = MillraceError::Repository("debug test".to_string());
        let debug_output = format!("{:?}", error);
        assert!(debug_output.contains("Repository"));
        assert!(debug_output.contains("debug test"));
    }
}
