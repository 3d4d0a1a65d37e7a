//! Error types for loghouse

/// Result type alias for loghouse operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for loghouse
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed query, payload, or grammar violation
    #[error("{0}")]
    BadRequest(String),
    /// Missing storage or chunk
    #[error("{0}")]
    NotFound(String),
    /// Wrong shutdown password
    #[error("{0}")]
    Forbidden(String),
    /// Storage already exists
    #[error("{0}")]
    Conflict(String),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Binary encoding/decoding errors
    #[error("Codec error: {0}")]
    Codec(String),
    /// A journal or descriptor file failed validation
    #[error("Corrupt file '{path}': {reason}")]
    Corrupt { path: String, reason: String },
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// HTTP status this error maps to. Unclassified errors are 500.
    pub fn status(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            _ => 500,
        }
    }

    /// Whether this error came from the storage layer rather than the caller.
    /// Mutation paths treat these as fatal for the operation: the before-image
    /// journal undoes partial changes and restart replay restores the rest.
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Codec(_) | Error::Corrupt { .. } | Error::Internal(_)
        )
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Error::Codec(e.to_string())
    }
}
