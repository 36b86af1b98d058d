use std::io;

use thiserror::Error;

/// Errors surfaced by backup/restore operations.
///
/// At most one error reaches the caller of an operation; anything that
/// fails during cleanup is logged and swallowed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("not a backup image (bad magic bytes)")]
    BadMagic,

    #[error("unsupported image format version {0}")]
    UnsupportedVersion(u16),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("malformed image: {0}")]
    Format(String),

    #[error("out of resources: {0}")]
    OutOfResources(String),

    #[error("{driver} driver failed: {reason}")]
    Driver { driver: String, reason: String },

    #[error("operation not permitted: {0}")]
    Policy(String),

    #[error("operation interrupted: {0}")]
    Concurrency(String),

    #[error("internal error: {0}")]
    Logic(String),
}

impl Error {
    pub fn io<S: Into<String>>(context: S, source: io::Error) -> Self {
        Error::Io { context: context.into(), source }
    }

    pub fn format<S: Into<String>>(msg: S) -> Self {
        Error::Format(msg.into())
    }

    /// Short read where the format requires more bytes.
    pub fn unexpected_eos() -> Self {
        Error::Format("unexpected end of stream".to_string())
    }

    pub fn driver<D: Into<String>, S: Into<String>>(driver: D, reason: S) -> Self {
        Error::Driver { driver: driver.into(), reason: reason.into() }
    }

    pub fn logic<S: Into<String>>(msg: S) -> Self {
        let msg = msg.into();
        log::error!("invariant violated: {}", msg);
        Error::Logic(msg)
    }

    pub fn cancelled() -> Self {
        Error::Concurrency("operation cancelled".to_string())
    }

    /// True for the prefix-rejection errors of the framed codec.
    pub fn is_prefix_rejection(&self) -> bool {
        matches!(self, Error::BadMagic | Error::UnsupportedVersion(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
