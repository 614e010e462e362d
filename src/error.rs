//! Crate-wide error type.
//!
//! Absence and conflict are not errors (see `spec`'s error taxonomy): those
//! surface as `Ok(None)`/`Ok(false)` from the relevant operations. `Error`
//! is reserved for cancellation, framing/auth failures that cannot be
//! expressed as a plain `None`, and unexpected I/O/protocol failures.

use thiserror::Error;

/// Errors produced by backends, codec wrappers, the frontend, and the lock.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying filesystem or network I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Cryptographic operation failed (key derivation, AEAD setup).
    #[error("crypto: {0}")]
    Crypto(String),
    /// AEAD authentication or digest verification failed.
    #[error("integrity check failed")]
    Integrity,
    /// Operation was cancelled via a `Cancel` handle.
    #[error("cancelled")]
    Cancelled,
    /// A `ContentId` string did not match the required shape.
    #[error("invalid content id: {0}")]
    InvalidId(String),
    /// A `MimeType` string did not match the required shape.
    #[error("invalid mime type: {0}")]
    InvalidMime(String),
    /// A `ConflictToken` was presented to a backend other than the one that minted it.
    #[error("conflict token used against the wrong backend")]
    WrongBackend,
    /// Advisory lock could not be acquired or released.
    #[error("lock: {0}")]
    Lock(String),
    /// Bucket backend HTTP failure other than 404/409/412.
    #[error("http: {0}")]
    Http(String),
    /// A stored tag record failed to parse as valid JSON for the `Tag` schema.
    #[error("malformed tag record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
