// Error types shared by the attachment pipeline, the transport and the session

use thiserror::Error;

/// Why a generation could not be started or why it ended in `Failed`.
///
/// A stopped generation is not an error; see `SessionOutcome::Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Description was empty or whitespace only.
    #[error("Please enter a description")]
    EmptyInput,

    #[error("Description is too long (maximum {max} characters)")]
    DescriptionTooLong { max: usize },

    #[error("Too many images. Maximum {max} images allowed.")]
    TooManyImages { max: usize },

    /// An image was not a JPEG/PNG data URI with a valid base64 payload.
    #[error("Invalid image format at position {index}. Images must be base64 encoded JPEG or PNG")]
    InvalidImage { index: usize },

    /// Network failure, unreachable endpoint or a broken response body.
    #[error("{0}")]
    Transport(String),

    /// Non-success status; `message` is the `detail` field or a generic fallback.
    #[error("{message}")]
    Server { status: u16, message: String },

    /// A success response whose body carried the service's error marker.
    #[error("{0}")]
    InBand(String),
}

impl GenerationError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Failed to read file: {name}")]
    ReadFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to inspect file {path}")]
    Inspect {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid base URL '{value}': {reason}")]
    InvalidBaseUrl { value: String, reason: String },
}
