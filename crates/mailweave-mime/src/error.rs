//! Error types for MIME operations.

/// Result type alias for MIME operations.
pub type Result<T> = std::result::Result<T, Error>;

/// MIME error types.
///
/// Everything except [`Error::Structure`] is a decode error: inside the body
/// pipeline these are recovered into a placeholder string, at the payload
/// boundary they are returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid MIME header.
    #[error("Invalid MIME header: {0}")]
    InvalidHeader(String),

    /// Invalid content type.
    #[error("Invalid content type: {0}")]
    InvalidContentType(String),

    /// Invalid transfer encoding or escape sequence.
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// Charset label that no decoder understands.
    #[error("Unsupported charset: {0}")]
    UnsupportedCharset(String),

    /// Missing boundary in multipart message.
    #[error("Missing boundary in multipart message")]
    MissingBoundary,

    /// Invalid multipart structure.
    #[error("Invalid multipart structure: {0}")]
    InvalidMultipart(String),

    /// A provider part that does not match the expected schema.
    #[error("Invalid message part {part}: {reason}")]
    InvalidPart {
        /// Part id, or `root` for the payload itself.
        part: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Part tree nested deeper than the traversal bound.
    #[error("Part tree exceeds maximum depth of {0}")]
    DepthExceeded(usize),

    /// Provider payload was not valid JSON for a message.
    #[error("Malformed provider payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Compose request with nothing renderable or nowhere to send it.
    #[error("Cannot compose message: {0}")]
    Structure(String),

    /// Parse error.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl Error {
    /// Returns `true` for errors caused by the compose request itself.
    #[must_use]
    pub const fn is_structure(&self) -> bool {
        matches!(self, Self::Structure(_))
    }
}
