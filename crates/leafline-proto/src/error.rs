//! Error types for the leafline-proto crate.

use thiserror::Error;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a frame.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a frame.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A field was present but unusable.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_display() {
        let err = ProtoError::MissingField("type");
        assert_eq!(err.to_string(), "missing required field: type");
    }

    #[test]
    fn test_invalid_field_display() {
        let err = ProtoError::InvalidField {
            field: "session_id",
            reason: "must be a non-empty string".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid field 'session_id': must be a non-empty string"
        );
    }
}
