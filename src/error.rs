use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the event loop core.
///
/// Mirrors the boundary status codes of the underlying status-code scheme
/// (`Good`, `BadInvalidArgument`, ...). `Good` has no variant here: success
/// is represented by `Ok(())`, as is idiomatic in Rust.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("internal error: {0}")]
    InternalError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("out of memory")]
    OutOfMemory,

    #[error("communication error: {0}")]
    CommunicationError(#[from] io::Error),
}

/// Companion status for contexts that need a lightweight terminal status
/// rather than a full `Error` (e.g. the status delivered to a connection
/// callback).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Good,
    BadInternalError,
    BadInvalidArgument,
    BadNotFound,
    BadAlreadyExists,
    BadConnectionClosed,
    BadOutOfMemory,
    BadCommunicationError,
}

impl StatusCode {
    pub fn is_good(self) -> bool {
        matches!(self, StatusCode::Good)
    }
}

impl From<&Error> for StatusCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::InternalError(_) => StatusCode::BadInternalError,
            Error::InvalidArgument(_) => StatusCode::BadInvalidArgument,
            Error::NotFound(_) => StatusCode::BadNotFound,
            Error::AlreadyExists(_) => StatusCode::BadAlreadyExists,
            Error::ConnectionClosed => StatusCode::BadConnectionClosed,
            Error::OutOfMemory => StatusCode::BadOutOfMemory,
            Error::CommunicationError(_) => StatusCode::BadCommunicationError,
        }
    }
}
