//! Error types for cacheprog_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using cacheprog_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding requests or touching the store.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file or stream operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// The input stream did not contain a well-formed JSON value.
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// A storage key is not usable as a file name.
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// A mapping file does not name a valid output.
    #[error("Corrupted mapping at {path}: {reason}")]
    CorruptedMapping { path: PathBuf, reason: String },

    /// A blob path cannot be sent to the client as a JSON string.
    #[error("Blob path is not valid UTF-8: {}", path.display())]
    NonUtf8Path { path: PathBuf },

    /// The value following a put request is not a byte array.
    #[error("Invalid put body: {reason}")]
    InvalidBody { reason: String },

    /// The put body does not have the declared length.
    #[error("Incorrect body length: got {got}, expected {expected}")]
    BodySizeMismatch { expected: i64, got: usize },

    /// A request lacks a field its command requires.
    #[error("Missing {field} in {command} request")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    /// The request names a command this backend does not implement.
    #[error("Unsupported command")]
    UnsupportedCommand,
}

impl Error {
    /// Create an InvalidKey error.
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Error::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Create a CorruptedMapping error.
    pub fn corrupted_mapping(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptedMapping {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidBody error.
    pub fn invalid_body(reason: impl Into<String>) -> Self {
        Error::InvalidBody {
            reason: reason.into(),
        }
    }

    /// Create a MissingField error.
    pub fn missing_field(command: &'static str, field: &'static str) -> Self {
        Error::MissingField { command, field }
    }

    /// Whether this error leaves the input stream unusable.
    ///
    /// Framing and JSON errors end the session; everything else is reported
    /// on the response of the request that caused it.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Json { .. } | Error::InvalidBody { .. } | Error::BodySizeMismatch { .. }
        )
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_errors_are_fatal() {
        let mismatch = Error::BodySizeMismatch {
            expected: 5,
            got: 4,
        };
        assert!(mismatch.is_session_fatal());
        assert_eq!(
            mismatch.to_string(),
            "Incorrect body length: got 4, expected 5"
        );
        assert!(Error::invalid_body("not a string").is_session_fatal());

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(Error::from(json).is_session_fatal());
    }

    #[test]
    fn test_storage_errors_are_request_local() {
        let io = Error::from(std::io::Error::other("disk on fire"));
        assert!(!io.is_session_fatal());
        assert!(!Error::invalid_key("empty").is_session_fatal());
        assert!(!Error::corrupted_mapping("/tmp/x", "bad hex").is_session_fatal());
        assert!(!Error::missing_field("get", "ActionID").is_session_fatal());
        assert!(!Error::UnsupportedCommand.is_session_fatal());
        let path = PathBuf::from("/tmp/cache/outputs/00");
        assert!(!Error::NonUtf8Path { path }.is_session_fatal());
    }
}
