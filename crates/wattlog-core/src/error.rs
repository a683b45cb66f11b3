//! Error types for the Wattlog event model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during event decoding and validation.
#[derive(Error, Debug)]
pub enum Error {
    /// The event root is not a JSON object.
    #[error("event root is not a JSON object")]
    NotAnObject,

    /// The natural key field is absent, empty, or not a string.
    #[error("missing or empty 'event_id' field")]
    MissingEventId,

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error marks input that can never become valid on retry.
    ///
    /// Malformed input is quarantined by the consumer; everything else is
    /// left in place and retried on the next poll.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            Self::NotAnObject | Self::MissingEventId | Self::Json(_)
        )
    }
}
